//! Scripted in-memory engine for unit tests.
//!
//! Counts every physical call and lets a test queue failures for the next
//! statements, commits, rollbacks or opens.

use crate::db::engine::{Engine, EngineConnection};
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteResult, QueryParam, Row};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptStats {
    pub opens: usize,
    pub closes: usize,
    pub executes: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Default)]
struct Script {
    stats: ScriptStats,
    statement_failures: VecDeque<DbError>,
    commit_failures: VecDeque<DbError>,
    rollback_failures: VecDeque<DbError>,
    open_failures: VecDeque<DbError>,
    open_delay: Option<Duration>,
    opened_paths: Vec<PathBuf>,
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    pub fn stats(&self) -> ScriptStats {
        self.script.lock().unwrap().stats
    }

    pub fn opened_paths(&self) -> Vec<PathBuf> {
        self.script.lock().unwrap().opened_paths.clone()
    }

    pub fn fail_statements(&self, errors: impl IntoIterator<Item = DbError>) {
        self.script
            .lock()
            .unwrap()
            .statement_failures
            .extend(errors);
    }

    pub fn fail_commits(&self, errors: impl IntoIterator<Item = DbError>) {
        self.script.lock().unwrap().commit_failures.extend(errors);
    }

    pub fn fail_rollbacks(&self, errors: impl IntoIterator<Item = DbError>) {
        self.script.lock().unwrap().rollback_failures.extend(errors);
    }

    pub fn fail_opens(&self, errors: impl IntoIterator<Item = DbError>) {
        self.script.lock().unwrap().open_failures.extend(errors);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.script.lock().unwrap().open_delay = Some(delay);
    }
}

impl Engine for ScriptedEngine {
    type Connection = ScriptedConnection;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(&self, path: &Path) -> DbResult<ScriptedConnection> {
        let delay = self.script.lock().unwrap().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock().unwrap();
        if let Some(err) = script.open_failures.pop_front() {
            return Err(err);
        }
        script.stats.opens += 1;
        script.opened_paths.push(path.to_path_buf());
        Ok(ScriptedConnection {
            path: path.to_path_buf(),
            script: self.script.clone(),
        })
    }
}

pub struct ScriptedConnection {
    path: PathBuf,
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnection {
    fn statement(&self) -> DbResult<()> {
        let mut script = self.script.lock().unwrap();
        script.stats.executes += 1;
        match script.statement_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl EngineConnection for ScriptedConnection {
    async fn execute(&mut self, _sql: &str, _params: &[QueryParam]) -> DbResult<ExecuteResult> {
        self.statement()?;
        Ok(ExecuteResult::new(1))
    }

    async fn query(&mut self, _sql: &str, _params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.statement()?;
        let mut row = Row::new();
        row.insert("path".to_string(), json!(self.path.display().to_string()));
        Ok(vec![row])
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.script.lock().unwrap().stats.begins += 1;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let mut script = self.script.lock().unwrap();
        script.stats.commits += 1;
        match script.commit_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let mut script = self.script.lock().unwrap();
        script.stats.rollbacks += 1;
        match script.rollback_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn close(self) -> DbResult<()> {
        self.script.lock().unwrap().stats.closes += 1;
        Ok(())
    }
}
