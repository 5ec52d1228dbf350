use std::path::{Path, PathBuf};

use convoy::error::ConvoyError;
use convoy::operation::{Operation, OperationRegistry};
use convoy::schedule::{EventBody, Schedule, DEFAULT_TASK_TIMEOUT};
use tempfile::TempDir;

fn write(dir: &Path, pattern: &str, text: &str) -> PathBuf {
    let pattern_dir = dir.join(pattern);
    std::fs::create_dir_all(&pattern_dir).unwrap();
    let path = pattern_dir.join("pattern.yml");
    std::fs::write(&path, text).unwrap();
    path
}

fn load(paths: &[PathBuf]) -> Result<Schedule, ConvoyError> {
    Schedule::load(paths, &OperationRegistry::builtin())
}

const APP: &str = r#"
events:
  setup:
    priority: 20
    task: configure
  deploy:
    ordered_tasks:
      - service: app
        task: configure
      - task: restart
tasks:
  configure:
    operations:
      - echo: configure
  restart:
    timeout: 30
    operations:
      - service:
          name: nginx
          action: restart
"#;

const DB: &str = r#"
name: database
events:
  setup:
    priority: 1
    task: init
tasks:
  init:
    filter:
      service: db
      tag: primary
    operations:
      - execute:
          file: bin/init.sh
"#;

#[test]
fn test_load_multiple_patterns() {
    let dir = TempDir::new().unwrap();
    let paths = vec![write(dir.path(), "app", APP), write(dir.path(), "db", DB)];

    let schedule = load(&paths).unwrap();
    let names: Vec<&str> = schedule.patterns().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["app", "database"]);

    let app = schedule.pattern("app").unwrap();
    assert_eq!(app.dir(), dir.path().join("app"));
    assert_eq!(app.tasks["configure"].timeout, DEFAULT_TASK_TIMEOUT);
    assert_eq!(app.tasks["restart"].timeout.as_secs(), 30);

    let init = schedule.task("database", "init").unwrap();
    assert_eq!(init.filter.service, "db");
    assert_eq!(init.filter.tag, "primary");
    assert_eq!(init.operations.len(), 1);
    assert_eq!(init.operations[0].name(), "execute");
}

#[test]
fn test_same_event_across_patterns_sorted_by_priority() {
    let dir = TempDir::new().unwrap();
    let paths = vec![write(dir.path(), "app", APP), write(dir.path(), "db", DB)];
    let schedule = load(&paths).unwrap();

    let setup: Vec<&str> = schedule
        .events_named("setup")
        .iter()
        .map(|e| e.pattern.as_str())
        .collect();
    assert_eq!(setup, vec!["database", "app"]);

    let deploy = schedule.events_named("deploy");
    assert_eq!(deploy.len(), 1);
    assert!(matches!(&deploy[0].body, EventBody::Ordered(entries) if entries.len() == 2));
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = load(&[dir.path().join("nope/pattern.yml")]).unwrap_err();
    assert!(matches!(err, ConvoyError::Config(_)));
}

#[test]
fn test_invalid_pattern_fails_whole_load() {
    let dir = TempDir::new().unwrap();
    let good = write(dir.path(), "app", APP);
    let bad = write(dir.path(), "bad", "events:\n  deploy:\n    task: ghost\n");
    assert!(matches!(load(&[good, bad]), Err(ConvoyError::Definition(_))));
}

#[test]
fn test_malformed_yaml_is_rejected() {
    let dir = TempDir::new().unwrap();
    let bad = write(dir.path(), "bad", "events: [unclosed\n");
    assert!(matches!(load(&[bad]), Err(ConvoyError::Yaml(_))));
}

#[test]
fn test_duplicate_pattern_names_rejected() {
    let dir = TempDir::new().unwrap();
    let first = write(dir.path(), "app", APP);
    let second = write(dir.path(), "other", "name: app\ntasks: {}\n");
    assert!(matches!(load(&[first, second]), Err(ConvoyError::Definition(_))));
}
