//! End-to-end pipeline scenarios against the scripted engine fake

use coderunner_core::config::RunnerConfig;
use coderunner_core::metrics::PipelineMetrics;
use coderunner_core::network::NetworkManager;
use coderunner_core::orchestrator::SessionOrchestrator;
use coderunner_core::pool::SessionPool;
use coderunner_core::protocol::{OutputType, ServerFrame};
use coderunner_core::queue::ExecutionQueue;
use coderunner_core::submission::FileEntry;
use coderunner_core::testing::{FakeEngine, FakeProgram};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Rig {
    engine: Arc<FakeEngine>,
    orchestrator: Arc<SessionOrchestrator>,
    metrics: Arc<PipelineMetrics>,
}

fn rig(config: RunnerConfig) -> Rig {
    let engine = Arc::new(FakeEngine::new());
    let config = Arc::new(config);
    let networks = Arc::new(NetworkManager::new(engine.clone(), config.network.clone()));
    let pool = Arc::new(SessionPool::new(
        engine.clone(),
        config.pool.clone(),
        config.resources.clone(),
    ));
    let queue = ExecutionQueue::new(config.queue.clone());
    let metrics = Arc::new(PipelineMetrics::new());
    let orchestrator = SessionOrchestrator::new(
        engine.clone(),
        networks,
        pool,
        queue,
        metrics.clone(),
        config,
    );
    Rig {
        engine,
        orchestrator,
        metrics,
    }
}

/// Register a socket and consume its greeting frame
async fn connect(rig: &Rig, session_key: &str) -> mpsc::UnboundedReceiver<ServerFrame> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    rig.orchestrator
        .register_session(session_key.to_string(), tx);
    match rx.recv().await.expect("greeting") {
        ServerFrame::Session { session_key: key } => assert_eq!(key, session_key),
        other => panic!("expected greeting, got {:?}", other),
    }
    rx
}

fn file(path: &str, content: &str, entry: bool) -> FileEntry {
    FileEntry {
        path: path.to_string(),
        content: content.to_string(),
        to_be_exec: entry,
    }
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> ServerFrame {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open")
}

/// Collect frames until the exit frame; returns (frames before exit, code)
async fn frames_until_exit(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> (Vec<ServerFrame>, i64) {
    let mut frames = Vec::new();
    loop {
        match next_frame(rx).await {
            ServerFrame::Exit { code, .. } => return (frames, code),
            frame => frames.push(frame),
        }
    }
}

fn stderr_text(frames: &[ServerFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerFrame::Output {
                output_type: OutputType::Stderr,
                data,
                ..
            } => Some(data.as_str()),
            _ => None,
        })
        .collect()
}

fn stdout_frames(frames: &[ServerFrame]) -> Vec<&str> {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerFrame::Output {
                output_type: OutputType::Stdout,
                data,
                ..
            } => Some(data.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_python_hello_world() {
    let rig = rig(RunnerConfig::default());
    rig.engine
        .add_program(FakeProgram::new("main.py").stdout("hi\n"));
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run(
            "s1",
            "python",
            vec![file("main.py", "print('hi')", true)],
            None,
        )
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 0);
    // Chunks between flushes coalesce into exactly one stdout frame
    assert_eq!(stdout_frames(&frames), vec!["hi\n"]);

    // The run command went through the quoting builder
    let history = rig.engine.exec_history();
    assert!(history.iter().any(|cmd| cmd.contains("python -u 'main.py'")));
}

#[tokio::test]
async fn test_multi_file_cpp_compile() {
    let rig = rig(RunnerConfig::default());
    rig.engine
        .add_program(FakeProgram::new("-o ./app").stdout("42"));
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run(
            "s1",
            "c++",
            vec![
                file(
                    "main.cpp",
                    "#include<iostream>\n#include\"g.h\"\nint main(){std::cout<<g();}",
                    false,
                ),
                file("g.h", "int g();", false),
                file("g.cpp", "#include\"g.h\"\nint g(){return 42;}", false),
            ],
            None,
        )
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 0);
    assert!(stdout_frames(&frames).concat().contains("42"));

    let history = rig.engine.exec_history();
    assert!(history
        .iter()
        .any(|cmd| cmd.contains("c++ 'main.cpp' 'g.cpp' -o ./app && ./app")));
}

#[tokio::test]
async fn test_cpp_filter_keeps_c_sources_out_of_upload() {
    let rig = rig(RunnerConfig::default());
    rig.engine.add_program(FakeProgram::new("-o ./app"));
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run(
            "s1",
            "c++",
            vec![
                file("main.cpp", "int main(){}", false),
                file("legacy.c", "int x;", false),
                file("g.h", "", false),
            ],
            None,
        )
        .unwrap();
    let (_, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 0);

    let uploaded: Vec<String> = rig
        .engine
        .uploaded_files("ctr-1")
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert!(uploaded.contains(&"main.cpp".to_string()));
    assert!(uploaded.contains(&"g.h".to_string()));
    assert!(!uploaded.contains(&"legacy.c".to_string()));
}

#[tokio::test]
async fn test_stop_mid_run() {
    let rig = rig(RunnerConfig::default());
    rig.engine.add_program(
        FakeProgram::new("loop.py")
            .stdout("x")
            .looping(Duration::from_millis(10)),
    );
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run(
            "s1",
            "python",
            vec![file("loop.py", "while True: print('x')", true)],
            None,
        )
        .unwrap();

    // Let it produce some output first
    loop {
        if let ServerFrame::Output { .. } = next_frame(&mut rx).await {
            break;
        }
    }
    rig.orchestrator.stop("s1");

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, -1);
    assert!(frames.iter().any(|f| matches!(
        f,
        ServerFrame::Output {
            output_type: OutputType::System,
            data,
            ..
        } if data == "[Process terminated]\n"
    )));

    // No second exit frame from the natural completion path
    let mut extra_exits = 0;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(300), rx.recv()).await
    {
        if matches!(frame, ServerFrame::Exit { .. }) {
            extra_exits += 1;
        }
    }
    assert_eq!(extra_exits, 0);
}

#[tokio::test]
async fn test_rate_limit_eleventh_run() {
    let rig = rig(RunnerConfig::default());
    rig.engine
        .add_program(FakeProgram::new("main.py").stdout("ok\n"));
    let mut rx = connect(&rig, "s1").await;

    for _ in 0..10 {
        rig.orchestrator
            .submit_run("s1", "python", vec![file("main.py", "", true)], None)
            .unwrap();
        let (_, code) = frames_until_exit(&mut rx).await;
        assert_eq!(code, 0);
    }
    let containers_before = rig.engine.container_count();
    let networks_before = rig.engine.network_names().len();

    rig.orchestrator
        .submit_run("s1", "python", vec![file("main.py", "", true)], None)
        .unwrap();
    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 1);
    assert!(stderr_text(&frames).contains("Rate limit exceeded"));

    // The rejected run never touched the pool or network layers
    assert_eq!(rig.engine.container_count(), containers_before);
    assert_eq!(rig.engine.network_names().len(), networks_before);
}

#[tokio::test]
async fn test_queue_full_third_submission() {
    let mut config = RunnerConfig::default();
    config.queue.max_concurrent = 1;
    config.queue.max_queue_size = 1;
    let rig = rig(config);
    rig.engine.add_program(
        FakeProgram::new("block.py")
            .stdout(".")
            .looping(Duration::from_millis(10)),
    );
    rig.engine
        .add_program(FakeProgram::new("main.py").stdout("done\n"));

    let mut rx1 = connect(&rig, "s1").await;
    let mut rx2 = connect(&rig, "s2").await;
    let mut rx3 = connect(&rig, "s3").await;

    // First run occupies the only slot
    rig.orchestrator
        .submit_run("s1", "python", vec![file("block.py", "", true)], None)
        .unwrap();
    loop {
        if let ServerFrame::Output { .. } = next_frame(&mut rx1).await {
            break;
        }
    }

    // Second waits in the queue
    rig.orchestrator
        .submit_run("s2", "python", vec![file("main.py", "", true)], None)
        .unwrap();

    // Third is rejected outright
    rig.orchestrator
        .submit_run("s3", "python", vec![file("main.py", "", true)], None)
        .unwrap();
    let (frames, code) = frames_until_exit(&mut rx3).await;
    assert_eq!(code, 1);
    assert!(stderr_text(&frames).contains("capacity"));

    // Freeing the slot lets the queued run through
    rig.orchestrator.stop("s1");
    let (_, code) = frames_until_exit(&mut rx1).await;
    assert_eq!(code, -1);
    let (_, code) = frames_until_exit(&mut rx2).await;
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_warm_reuse_speeds_up_second_run() {
    let rig = rig(RunnerConfig::default());
    rig.engine
        .add_program(FakeProgram::new("main.py").stdout("ok\n"));
    rig.engine
        .set_container_create_delay(Duration::from_millis(30));
    let mut rx = connect(&rig, "s1").await;

    for _ in 0..2 {
        rig.orchestrator
            .submit_run("s1", "python", vec![file("main.py", "", true)], None)
            .unwrap();
        let (_, code) = frames_until_exit(&mut rx).await;
        assert_eq!(code, 0);
    }

    let recent = rig.metrics.recent(2);
    assert_eq!(recent.len(), 2);
    assert!(!recent[0].container_reused);
    assert!(recent[1].container_reused);
    assert!(recent[1].container_ms < recent[0].container_ms);
    assert_eq!(rig.engine.container_count(), 1);
}

#[tokio::test]
async fn test_exec_timeout_surfaces_stderr_and_exit_one() {
    let mut config = RunnerConfig::default();
    config.exec_timeout_ms = 100;
    let rig = rig(config);
    // Produces one chunk then stays open until killed
    let mut hung = FakeProgram::new("main.py").stdout("partial");
    hung.hang = true;
    rig.engine.add_program(hung);
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run("s1", "python", vec![file("main.py", "", true)], None)
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 1);
    assert!(stderr_text(&frames).contains("timed out"));
}

#[tokio::test]
async fn test_input_reaches_program_stdin() {
    let rig = rig(RunnerConfig::default());
    rig.engine.add_program(
        FakeProgram::new("echo.py")
            .stdout(".")
            .looping(Duration::from_millis(20)),
    );
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run("s1", "python", vec![file("echo.py", "", true)], None)
        .unwrap();
    loop {
        if let ServerFrame::Output { .. } = next_frame(&mut rx).await {
            break;
        }
    }

    rig.orchestrator.handle_input("s1", "hello\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.engine.stdin_received(), b"hello\n");

    rig.orchestrator.stop("s1");
    let (_, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, -1);
}

#[tokio::test]
async fn test_validation_failure_touches_nothing() {
    let rig = rig(RunnerConfig::default());
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run(
            "s1",
            "python",
            vec![file("../escape.py", "print(1)", true)],
            None,
        )
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 1);
    assert!(stderr_text(&frames).contains("Validation failed"));
    assert_eq!(rig.engine.container_count(), 0);
    assert!(rig.engine.network_names().is_empty());
}

#[tokio::test]
async fn test_unknown_language_is_validation_failure() {
    let rig = rig(RunnerConfig::default());
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run("s1", "ruby", vec![file("main.rb", "puts 1", true)], None)
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 1);
    assert!(stderr_text(&frames).contains("unknown language"));
    assert_eq!(rig.engine.container_count(), 0);
}

#[tokio::test]
async fn test_acquisition_retry_then_failure_frame() {
    let rig = rig(RunnerConfig::default());
    // Both attempts fail to create a container
    rig.engine.fail_container_creates(2);
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run("s1", "python", vec![file("main.py", "", true)], None)
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 1);
    assert!(stderr_text(&frames).contains("execution environment"));
}

#[tokio::test]
async fn test_acquisition_recovers_on_retry() {
    let rig = rig(RunnerConfig::default());
    rig.engine
        .add_program(FakeProgram::new("main.py").stdout("ok\n"));
    rig.engine.fail_container_creates(1);
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run("s1", "python", vec![file("main.py", "", true)], None)
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 0);
    assert_eq!(stdout_frames(&frames), vec!["ok\n"]);
}

#[tokio::test]
async fn test_disconnect_tears_down_session() {
    let rig = rig(RunnerConfig::default());
    rig.engine
        .add_program(FakeProgram::new("main.py").stdout("ok\n"));
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run("s1", "python", vec![file("main.py", "", true)], None)
        .unwrap();
    let (_, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 0);
    assert_eq!(rig.engine.container_count(), 1);
    assert_eq!(rig.engine.network_names().len(), 1);

    rig.orchestrator.disconnect("s1").await;
    assert_eq!(rig.engine.container_count(), 0);
    assert!(rig.engine.network_names().is_empty());

    // The session is gone; further runs are a caller error
    assert!(rig
        .orchestrator
        .submit_run("s1", "python", vec![file("main.py", "", true)], None)
        .is_err());
}

#[tokio::test]
async fn test_sql_falls_back_to_first_sql_file() {
    let rig = rig(RunnerConfig::default());
    rig.engine
        .add_program(FakeProgram::new("mysql").stdout("1 row\n"));
    let mut rx = connect(&rig, "s1").await;

    rig.orchestrator
        .submit_run(
            "s1",
            "sql",
            vec![file("query.sql", "select 1;", false)],
            None,
        )
        .unwrap();

    let (frames, code) = frames_until_exit(&mut rx).await;
    assert_eq!(code, 0);
    assert_eq!(stdout_frames(&frames), vec!["1 row\n"]);

    // The database runtime got its readiness probe before the run
    let history = rig.engine.exec_history();
    assert!(history.iter().any(|cmd| cmd.contains("mysqladmin ping")));
    assert!(history
        .iter()
        .any(|cmd| cmd.contains("mysql -uroot") && cmd.contains("'query.sql'")));
}
