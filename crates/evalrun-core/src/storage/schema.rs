pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS test_sets (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  body_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  configuration_id TEXT NOT NULL,
  status TEXT NOT NULL,
  total_cases INTEGER NOT NULL,
  config_json TEXT NOT NULL,
  metrics_json TEXT NOT NULL,
  rescored_from TEXT REFERENCES runs(id),
  created_at TEXT NOT NULL,
  finished_at TEXT
);

-- One slot per (run, test case): results are append-only.
CREATE TABLE IF NOT EXISTS results (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL REFERENCES runs(id),
  case_index INTEGER NOT NULL,
  test_case_id TEXT NOT NULL,
  status TEXT NOT NULL,
  provider TEXT NOT NULL,
  retries INTEGER NOT NULL DEFAULT 0,
  body_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(run_id, test_case_id)
);

CREATE TABLE IF NOT EXISTS traces (
  trace_id TEXT PRIMARY KEY,
  body_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_results_run ON results(run_id, case_index);
CREATE INDEX IF NOT EXISTS idx_runs_rescored_from ON runs(rescored_from);
"#;
