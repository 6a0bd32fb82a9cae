use super::{Persistence, SaveOutcome};
use crate::model::{RunStatus, TestResult, TestRun, TestSet};
use crate::trace::Trace;
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(super::schema::DDL)
            .context("failed to apply schema")?;
        Ok(())
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store connection mutex poisoned"))
    }

    fn insert_result(conn: &Connection, result: &TestResult) -> anyhow::Result<SaveOutcome> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO results
                (id, run_id, case_index, test_case_id, status, provider, retries, body_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.id,
                result.run_id,
                result.case_index as i64,
                result.test_case.id,
                result.status.as_str(),
                result.provider,
                result.retries,
                serde_json::to_string(result)?,
                result.finished_at.to_rfc3339(),
            ],
        )?;
        Ok(if changed == 0 {
            SaveOutcome::AlreadyExists
        } else {
            SaveOutcome::Inserted
        })
    }

    fn results_for_run(conn: &Connection, run_id: &str) -> anyhow::Result<Vec<TestResult>> {
        let mut stmt = conn.prepare(
            "SELECT body_json FROM results WHERE run_id = ?1 ORDER BY case_index ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(decode_result(&body?)?);
        }
        Ok(out)
    }
}

fn decode_result(body: &str) -> anyhow::Result<TestResult> {
    serde_json::from_str(body).context("corrupt test result row")
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

impl Persistence for Store {
    fn save_test_set(&self, set: &TestSet) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO test_sets(id, name, body_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, body_json = excluded.body_json",
            params![set.id, set.name, serde_json::to_string(set)?],
        )?;
        Ok(())
    }

    fn load_test_set(&self, id: &str) -> anyhow::Result<Option<TestSet>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM test_sets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).context("corrupt test set row"))
            .transpose()
    }

    fn save_test_result(&self, result: &TestResult) -> anyhow::Result<SaveOutcome> {
        let conn = self.conn()?;
        Self::insert_result(&conn, result)
    }

    fn load_test_result(&self, id: &str) -> anyhow::Result<Option<TestResult>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM results WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.as_deref().map(decode_result).transpose()
    }

    fn find_test_result(
        &self,
        run_id: &str,
        test_case_id: &str,
    ) -> anyhow::Result<Option<TestResult>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM results WHERE run_id = ?1 AND test_case_id = ?2",
                params![run_id, test_case_id],
                |row| row.get(0),
            )
            .optional()?;
        body.as_deref().map(decode_result).transpose()
    }

    fn load_test_results(&self, run_id: &str) -> anyhow::Result<Vec<TestResult>> {
        let conn = self.conn()?;
        Self::results_for_run(&conn, run_id)
    }

    fn save_test_run(&self, run: &TestRun) -> anyhow::Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO runs
                (id, configuration_id, status, total_cases, config_json, metrics_json,
                 rescored_from, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                total_cases = excluded.total_cases,
                finished_at = excluded.finished_at
             WHERE runs.status IN ('pending', 'running')",
            params![
                run.id,
                run.configuration.id,
                run.status.as_str(),
                run.total_cases as i64,
                serde_json::to_string(&run.configuration)?,
                serde_json::to_string(&run.metrics)?,
                run.rescored_from,
                run.created_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        for r in &run.results {
            Self::insert_result(&tx, r)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_test_run(&self, id: &str) -> anyhow::Result<Option<TestRun>> {
        let conn = self.conn()?;
        let header = conn
            .query_row(
                "SELECT status, total_cases, config_json, metrics_json, rescored_from,
                        created_at, finished_at
                 FROM runs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, total, config_json, metrics_json, rescored_from, created, finished)) =
            header
        else {
            return Ok(None);
        };

        let status = RunStatus::parse(&status)
            .with_context(|| format!("unknown run status '{}'", status))?;
        Ok(Some(TestRun {
            id: id.to_string(),
            configuration: serde_json::from_str(&config_json).context("corrupt run config")?,
            metrics: serde_json::from_str(&metrics_json).context("corrupt run metrics")?,
            status,
            total_cases: usize::try_from(total).unwrap_or(0),
            results: Self::results_for_run(&conn, id)?,
            rescored_from,
            created_at: parse_ts(&created)?,
            finished_at: finished.as_deref().map(parse_ts).transpose()?,
        }))
    }

    fn save_trace(&self, trace: &Trace) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO traces(trace_id, body_json) VALUES (?1, ?2)
             ON CONFLICT(trace_id) DO UPDATE SET body_json = excluded.body_json",
            params![trace.trace_id, serde_json::to_string(trace)?],
        )?;
        Ok(())
    }

    fn load_trace(&self, id: &str) -> anyhow::Result<Option<Trace>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM traces WHERE trace_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).context("corrupt trace row"))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Output, TestCase, TestConfiguration, TestResultStatus, Turn,
    };

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s
    }

    fn result(run_id: &str, case: &str, idx: usize) -> TestResult {
        TestResult {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            case_index: idx,
            test_case: TestCase::single_turn(case, "prompt"),
            status: TestResultStatus::Completed,
            provider: "single_turn".into(),
            output: Some(Output::single_turn("prompt", Turn::assistant("ok"), "single_turn")),
            metrics: vec![],
            attempts: vec![],
            retries: 0,
            error: None,
            error_kind: None,
            rescored_from: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn result_slots_are_append_only() {
        let s = store();
        let first = result("run-1", "t1", 0);
        assert_eq!(s.save_test_result(&first).unwrap(), SaveOutcome::Inserted);

        let dup = result("run-1", "t1", 0);
        assert_eq!(s.save_test_result(&dup).unwrap(), SaveOutcome::AlreadyExists);

        let stored = s.load_test_results("run-1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, first.id);
    }

    #[test]
    fn results_load_in_case_order() {
        let s = store();
        s.save_test_result(&result("r", "b", 1)).unwrap();
        s.save_test_result(&result("r", "a", 0)).unwrap();
        let ids: Vec<String> = s
            .load_test_results("r")
            .unwrap()
            .iter()
            .map(|r| r.test_case.id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn terminal_run_status_is_final() {
        let s = store();
        let cfg = TestConfiguration::live("cfg", "set", "http://target");
        let mut run = TestRun::new(cfg, vec![], 1);
        run.status = RunStatus::Running;
        s.save_test_run(&run).unwrap();

        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        s.save_test_run(&run).unwrap();

        run.status = RunStatus::Failed;
        s.save_test_run(&run).unwrap();

        let loaded = s.load_test_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn on_disk_store_roundtrips_run_with_results() {
        let tmp = tempfile::tempdir().unwrap();
        let s = Store::open(&tmp.path().join("evalrun.db")).unwrap();
        s.init_schema().unwrap();

        let cfg = TestConfiguration::live("cfg", "set", "http://target");
        let mut run = TestRun::new(cfg, vec![], 1);
        run.status = RunStatus::Completed;
        run.results.push(result(&run.id, "t1", 0));
        s.save_test_run(&run).unwrap();

        let loaded = s.load_test_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.results, run.results);
        assert!(s.load_test_run("missing").unwrap().is_none());
    }
}
