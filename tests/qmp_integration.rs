//! Monitor engine against a real child process speaking the line protocol.
#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use vmhost::qmp::{self, QmpError};

/// Replies to every command with its own name, raises an event before
/// answering `stop`, and exits on `quit`.
const ECHO_MONITOR: &str = r#"
echo '{"QMP":{"version":{},"capabilities":["oob"]}}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  cmd=$(printf '%s' "$line" | sed -n 's/.*"execute":"\([^"]*\)".*/\1/p')
  [ -z "$id" ] && { echo '{"return":{}}'; continue; }
  case "$cmd" in
    stop) echo '{"event":"STOP","timestamp":{"seconds":1,"microseconds":0}}' ;;
    fail) printf '{"error":{"class":"GenericError","desc":"refused %s"},"id":"%s"}\n' "$id" "$id"; continue ;;
    quit) printf '{"return":{},"id":"%s"}\n' "$id"; exit 0 ;;
  esac
  printf '{"return":{"cmd":"%s"},"id":"%s"}\n' "$cmd" "$id"
done
"#;

fn spawn_monitor() -> tokio::process::Child {
    Command::new("sh")
        .arg("-c")
        .arg(ECHO_MONITOR)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn sh")
}

#[tokio::test]
async fn test_concurrent_requests_resolve_to_their_own_replies() {
    let mut child = spawn_monitor();
    let stdout = child.stdout.take().unwrap();
    let stdin = child.stdin.take().unwrap();
    let (monitor, event_loop) = qmp::handshake(stdout, stdin, Duration::from_secs(5))
        .await
        .unwrap();
    let mut events = monitor.subscribe();
    let loop_task = tokio::spawn(event_loop.run());

    let commands: Vec<String> = (0..8).map(|i| format!("cmd-{i}")).collect();
    let replies = futures::future::join_all(
        commands
            .iter()
            .map(|command| monitor.execute(command, Some(json!({ "n": 1 })))),
    )
    .await;
    for (command, reply) in commands.iter().zip(replies) {
        assert_eq!(reply.unwrap()["cmd"], command.as_str());
    }
    assert_eq!(monitor.pending_count(), 0);

    // The capabilities reply has no id and arrives as an event.
    let first = events.recv().await.unwrap();
    assert!(first.name.is_none());
    assert_eq!(first.raw, json!({ "return": {} }));

    monitor.execute("stop", None).await.unwrap();
    let stop = events.recv().await.unwrap();
    assert_eq!(stop.name.as_deref(), Some("STOP"));

    let err = monitor.execute("fail", None).await.unwrap_err();
    assert!(matches!(&err, QmpError::Remote(desc) if desc.starts_with("refused ")));

    monitor.execute("quit", None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), loop_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        monitor.execute("query-status", None).await,
        Err(QmpError::Closed)
    ));
    assert!(child.wait().await.unwrap().success());
}

#[tokio::test]
async fn test_killed_process_fails_waiting_request() {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(r#"echo '{"QMP":{"capabilities":[]}}'; read -r caps; read -r req; exec sleep 30"#)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let stdout = child.stdout.take().unwrap();
    let stdin = child.stdin.take().unwrap();
    let (monitor, event_loop) = qmp::handshake(stdout, stdin, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(monitor.enabled_capabilities().is_empty());
    let loop_task = tokio::spawn(event_loop.run());

    let waiting = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.execute("query-vnc", None).await })
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while monitor.pending_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    child.start_kill().unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(QmpError::Closed)));
    loop_task.await.unwrap().unwrap();
}
