use anyhow::Result;
use async_trait::async_trait;
use lf_agent::config::PluginSpec;
use lf_agent::engine::{Engine, EngineConfig};
use lf_agent::error::ConfigError;
use lf_agent::event::Event;
use lf_agent::plugin::{Output, Plugin, PluginOptions};
use lf_agent::registry::{build_filter, build_input, build_parser};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct Collect {
    events: Mutex<Vec<Event>>,
}

impl Collect {
    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let events = self.snapshot();
            if events.len() >= count || Instant::now() >= deadline {
                return events;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl Plugin for Collect {
    fn name(&self) -> &str {
        "collect"
    }

    fn init(&mut self, _: &PluginOptions) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Output for Collect {
    async fn write(&self, events: &[Event]) -> Result<()> {
        self.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn spec(raw: &str) -> PluginSpec {
    toml::from_str(raw).unwrap()
}

fn tail_spec(dir: &TempDir) -> PluginSpec {
    spec(&format!(
        r#"
type = "tail"
name = "files"
tag = "app.logs"
glob = "{dir}/*.log"
db_file = "{dir}/state/tail.db"
poll_interval_ms = 10
debounce_ms = 50
"#,
        dir = dir.path().display()
    ))
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        buffer_size: 100,
        flush_interval: Duration::from_millis(50),
        channel_capacity: 64,
    }
}

fn append(path: &Path, line: &str) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    writeln!(file, "{line}").unwrap();
}

#[tokio::test]
async fn tails_appends_and_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("test.log");
    std::fs::write(&log, "line1\nline2\n").unwrap();

    let collect = Arc::new(Collect::default());
    let mut engine = Engine::new(engine_config());
    engine.add_input(build_input(&tail_spec(&dir), "it-host").unwrap());
    engine.add_output(collect.clone());
    engine.start().unwrap();

    let events = collect.wait_for(2).await;
    let lines: Vec<_> = events.iter().map(|e| (e.raw_data.as_str(), e.metadata.line_num)).collect();
    assert_eq!(lines, vec![("line1", 1), ("line2", 2)]);
    assert_eq!(events[0].metadata.source, log.to_string_lossy());
    assert_eq!(events[0].metadata.tag, "app.logs");
    assert_eq!(events[0].metadata.host, "it-host");
    assert_eq!(events[0].metadata.input_source, "files");

    append(&log, "line3");
    let events = collect.wait_for(3).await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].raw_data, "line3");
    assert_eq!(events[2].metadata.line_num, 3);

    engine.stop().await.unwrap();

    // A fresh agent over the same state database only sees what was appended since.
    append(&log, "line4");
    let collect = Arc::new(Collect::default());
    let mut engine = Engine::new(engine_config());
    engine.add_input(build_input(&tail_spec(&dir), "it-host").unwrap());
    engine.add_output(collect.clone());
    engine.start().unwrap();

    let events = collect.wait_for(1).await;
    sleep(Duration::from_millis(300)).await;
    let events_after = collect.snapshot();
    engine.stop().await.unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events_after.len(), 1);
    assert_eq!(events[0].raw_data, "line4");
    assert_eq!(events[0].metadata.line_num, 4);
}

#[tokio::test]
async fn rotated_file_is_read_from_the_start() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("rotate.log");
    std::fs::write(&log, "old-1\nold-2\n").unwrap();

    let collect = Arc::new(Collect::default());
    let mut engine = Engine::new(engine_config());
    engine.add_input(build_input(&tail_spec(&dir), "h").unwrap());
    engine.add_output(collect.clone());
    engine.start().unwrap();
    assert_eq!(collect.wait_for(2).await.len(), 2);

    std::fs::rename(&log, dir.path().join("rotate.log.1")).unwrap();
    std::fs::write(&log, "new-1\n").unwrap();

    let events = collect.wait_for(3).await;
    engine.stop().await.unwrap();

    let new = events.iter().find(|e| e.raw_data == "new-1").expect("new file was not tailed");
    assert_eq!(new.metadata.line_num, 1);
}

#[tokio::test]
async fn parsed_and_filtered_events_reach_outputs() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("json.log");
    std::fs::write(
        &log,
        concat!(
            r#"{"level":"error","msg":"db down"}"#,
            "\n",
            r#"{"level":"debug","msg":"noise"}"#,
            "\n",
            "plain text line\n",
        ),
    )
    .unwrap();

    let collect = Arc::new(Collect::default());
    let mut engine = Engine::new(engine_config());
    engine.add_input(build_input(&tail_spec(&dir), "h").unwrap());
    engine.add_parser(build_parser(&spec("type = \"json\"")).unwrap());
    engine.add_filter(
        build_filter(&spec(
            r#"
type = "grep"
tag = "app.*"
exclude = [{ key = "level", pattern = "^debug$" }]
"#,
        ))
        .unwrap(),
    );
    engine.add_output(collect.clone());
    engine.start().unwrap();

    let events = collect.wait_for(2).await;
    sleep(Duration::from_millis(200)).await;
    engine.stop().await.unwrap();

    let events_after = collect.snapshot();
    assert_eq!(events.len(), 2);
    assert_eq!(events_after.len(), 2);
    assert_eq!(events[0].field_as_string("msg").as_deref(), Some("db down"));
    assert_eq!(events[1].raw_data, "plain text line");
    assert!(events[1].parsed_data.is_none());
}
