//! Fakes shared by the unit tests.

use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::error::{BackupError, Result};
use crate::models::backup_config::{self, BackendType, BackupConfigRecord};
use crate::models::backup_job::{self, BackupJob};
use crate::models::inventory;
use crate::services::backup_engine::BackupService;
use crate::services::command_runner::{CommandOutput, CommandRunner, Invocation, UserIdentity, UserDirectory};
use crate::services::concurrency::WorkerGate;
use crate::services::secrets::{AesGcmCodec, SecretCodec};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// The identity the tests run as, with `home` swapped in.
pub fn current_identity(home: &Path) -> UserIdentity {
    use nix::unistd::{getegid, geteuid, User};

    let uid = geteuid();
    UserIdentity {
        name: User::from_uid(uid).ok().flatten().map(|u| u.name).unwrap_or_default(),
        home: home.to_path_buf(),
        uid: uid.as_raw(),
        gid: getegid().as_raw(),
    }
}

pub fn temp_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = create_pool(&dir.path().join("panel.db").to_string_lossy()).unwrap();
    migrate(&pool).unwrap();
    (dir, pool)
}

#[derive(Default)]
pub struct FakeUsers {
    users: Mutex<HashMap<String, UserIdentity>>,
}

impl FakeUsers {
    pub fn add(&self, name: &str, home: &Path) {
        let mut identity = current_identity(home);
        identity.name = name.to_string();
        self.users.lock().unwrap().insert(name.to_string(), identity);
    }
}

impl UserDirectory for FakeUsers {
    fn lookup(&self, username: &str) -> Result<UserIdentity> {
        self.users
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(format!("system user {username} not found")))
    }
}

pub fn success(stdout: &str) -> CommandOutput {
    CommandOutput { status: Some(0), stdout: stdout.to_string(), stderr: String::new() }
}

pub fn failure(status: i32, stderr: &str) -> CommandOutput {
    CommandOutput { status: Some(status), stdout: String::new(), stderr: stderr.to_string() }
}

pub type Action = Arc<dyn Fn(&Invocation) + Send + Sync>;

struct Rule {
    pattern: String,
    replies: VecDeque<CommandOutput>,
    action: Option<Action>,
}

/// Scripted [`CommandRunner`]. A rule matches when its pattern occurs in
/// the rendered command line; the first matching rule answers. Replies are
/// consumed in order, the last one repeats. Unmatched commands succeed
/// with empty output.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    rules: Mutex<Vec<Rule>>,
    missing: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `reply` for commands containing `pattern`.
    pub fn on(&self, pattern: &str, reply: CommandOutput) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                replies: VecDeque::from([reply]),
                action: None,
            }),
        }
    }

    /// Like [`FakeRunner::on`], also running `action` on every match.
    pub fn on_with(&self, pattern: &str, reply: CommandOutput, action: Action) {
        self.on(pattern, reply);
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
            rule.action = Some(action);
        }
    }

    pub fn set_missing(&self, program: &str) {
        self.missing.lock().unwrap().push(program.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.invocations().iter().map(ToString::to_string).collect()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, _user: &UserIdentity, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let rendered = invocation.to_string();

        let (reply, action) = {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| rendered.contains(&r.pattern)) {
                Some(rule) => {
                    let reply = if rule.replies.len() > 1 {
                        rule.replies.pop_front().unwrap_or_default()
                    } else {
                        rule.replies.front().cloned().unwrap_or_default()
                    };
                    (reply, rule.action.clone())
                }
                None => (success(""), None),
            }
        };

        if let Some(action) = action {
            action(invocation);
        }
        Ok(reply)
    }

    fn locate(&self, program: &str) -> bool {
        !self.missing.lock().unwrap().iter().any(|p| p == program)
    }
}

/// Action for `restic restore` that materializes every `--include` below
/// `--target`: paths ending in `.gz` or `.json` become files (content
/// taken from the first matching suffix in `contents`, else `data`),
/// anything else a directory holding `index.html`.
pub fn restore_materializer(contents: &[(&str, &str)]) -> Action {
    let contents: Vec<(String, String)> =
        contents.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Arc::new(move |invocation: &Invocation| {
        let args = invocation.args();
        let mut target = None;
        let mut includes = Vec::new();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--target" if i + 1 < args.len() => {
                    target = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
                "--include" if i + 1 < args.len() => {
                    includes.push(args[i + 1].clone());
                    i += 1;
                }
                _ => {}
            }
            i += 1;
        }
        let Some(target) = target else {
            return;
        };

        for include in includes {
            let dest = target.join(include.trim_start_matches('/'));
            if include.ends_with(".gz") || include.ends_with(".json") {
                std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                let body = contents
                    .iter()
                    .find(|(suffix, _)| include.ends_with(suffix.as_str()))
                    .map(|(_, body)| body.as_str())
                    .unwrap_or("data");
                std::fs::write(&dest, body).unwrap();
            } else {
                std::fs::create_dir_all(&dest).unwrap();
                std::fs::write(dest.join("index.html"), "<h1>restored</h1>").unwrap();
            }
        }
    })
}

/// A wired-up [`BackupService`] for user `alice`, backed by a temp
/// database, a temp home and a [`FakeRunner`].
pub struct Fixture {
    pub service: Arc<BackupService>,
    pub runner: Arc<FakeRunner>,
    pub codec: Arc<AesGcmCodec>,
    pub pool: DbPool,
    pub home: tempfile::TempDir,
    _db_dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_workers(2)
    }

    pub fn with_workers(workers: usize) -> Self {
        let (db_dir, pool) = temp_pool();
        let home = tempfile::tempdir().unwrap();
        let users = Arc::new(FakeUsers::default());
        users.add("alice", home.path());
        let runner = Arc::new(FakeRunner::new());
        let codec = Arc::new(AesGcmCodec::from_passphrase("test-secret").unwrap());

        let service = Arc::new(BackupService::new(
            pool.clone(),
            codec.clone(),
            runner.clone(),
            users,
            WorkerGate::new(Some(workers)),
        ));
        Self { service, runner, codec, pool, home, _db_dir: db_dir }
    }

    /// Stores a working local-repository config, then applies `edit`.
    pub fn configure(&self, edit: impl FnOnce(&mut BackupConfigRecord)) {
        let mut cfg = BackupConfigRecord::default_for("alice");
        cfg.backend_type = BackendType::Local;
        cfg.repository = "/srv/restic/alice".into();
        cfg.password_enc = self.codec.encrypt("repo-pw").unwrap();
        cfg.enabled = true;
        edit(&mut cfg);
        backup_config::upsert(&self.pool.get().unwrap(), &cfg).unwrap();
    }

    /// Adds a site whose document root is `~/apps/<domain>/public`.
    pub fn add_site(&self, id: &str, domain: &str) -> PathBuf {
        let docroot = self.home.path().join("apps").join(domain).join("public");
        inventory::insert_site(&self.pool.get().unwrap(), id, "alice", domain, &docroot.to_string_lossy());
        docroot
    }

    pub fn add_database(&self, id: &str, name: &str, db_user: &str, password: &str) {
        let enc = if password.is_empty() { String::new() } else { self.codec.encrypt(password).unwrap() };
        inventory::insert_database(&self.pool.get().unwrap(), id, "alice", name, db_user, &enc);
    }

    pub fn config(&self) -> BackupConfigRecord {
        backup_config::get(&self.pool.get().unwrap(), "alice").unwrap().unwrap()
    }

    pub fn job(&self, id: &str) -> BackupJob {
        backup_job::find_by_id(&self.pool.get().unwrap(), id).unwrap().unwrap()
    }
}
