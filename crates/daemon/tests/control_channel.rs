//! Control channel round trips over a real socket

#![cfg(unix)]

mod common;

use common::{job, wait_for_status, write_script, FakeFfmpeg};
use pwebm_daemon::ipc::{client, ClientError, Request, Response, Server};
use pwebm_daemon::probe::{FfprobeProber, Prober};
use pwebm_daemon::queue::JobQueue;
use pwebm_daemon::status::Status;
use pwebm_daemon::{Config, Daemon};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

struct Running {
    queue: Arc<JobQueue>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), pwebm_daemon::ServerError>>,
}

async fn start(dir: &TempDir, ffmpeg: &FakeFfmpeg) -> (std::path::PathBuf, Running) {
    let path = dir.path().join("pwebm.sock");
    let queue = Arc::new(JobQueue::new(ffmpeg.encoder(dir.path(), 60.0)));
    let server = Server::bind(&path).await.unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.serve(queue.clone(), shutdown.clone()));
    (
        path,
        Running {
            queue,
            shutdown,
            task,
        },
    )
}

#[tokio::test]
async fn fresh_server_reports_idle() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = FakeFfmpeg::new(dir.path(), ":", "exit 0", "exit 0");
    let (path, running) = start(&dir, &ffmpeg).await;

    assert_eq!(client::status(&path).await.unwrap(), Status::Idle);

    let raw = client::send(&path, &Request::Status).await.unwrap();
    assert_eq!(
        raw,
        Response::Status {
            success: true,
            status_snapshot: Status::Idle,
        }
    );

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
    assert!(!path.exists());
    assert!(matches!(client::status(&path).await, Err(ClientError::NoServer)));
}

#[tokio::test]
async fn enqueue_and_kill_reach_the_queue() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = FakeFfmpeg::new(dir.path(), ":", "fill 100\nexec sleep 30", "exit 1");
    let (path, running) = start(&dir, &ffmpeg).await;

    client::enqueue(&path, job(dir.path(), "out.webm", 0.0)).await.unwrap();
    assert_eq!(running.queue.total_count(), 1);

    let mut invalid = job(dir.path(), "bad.webm", 0.0);
    invalid.inputs.clear();
    assert!(matches!(
        client::enqueue(&path, invalid).await,
        Err(ClientError::Rejected("enqueue"))
    ));

    let processing = {
        let queue = running.queue.clone();
        tokio::spawn(async move { queue.process_queue().await })
    };
    wait_for_status(running.queue.status(), |s| matches!(s, Status::SecondPass { .. })).await;

    let status = client::status(&path).await.unwrap();
    assert!(matches!(status, Status::SecondPass { tries: 1, current: 1, total: 1, .. }));

    // answered only once the encode is gone
    client::kill(&path).await.unwrap();
    assert!(!running.queue.is_processing());

    let report = processing.await.unwrap().unwrap();
    assert!(report.aborted);

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_request_gets_no_answer() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = FakeFfmpeg::new(dir.path(), ":", "exit 0", "exit 0");
    let (path, running) = start(&dir, &ffmpeg).await;

    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream.write_all(b"{\"type\":\"reboot\"}\n").await.unwrap();
    let mut answer = Vec::new();
    stream.read_to_end(&mut answer).await.unwrap();
    assert!(answer.is_empty());

    // the server keeps serving
    assert_eq!(client::status(&path).await.unwrap(), Status::Idle);

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn daemon_runs_the_first_job_and_exits() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = FakeFfmpeg::new(dir.path(), ":", "fill 100\nexit 0", "exit 1");
    let path = dir.path().join("pwebm.sock");

    let daemon = Daemon::with_encoder(Config::default(), ffmpeg.encoder(dir.path(), 10.0));
    let server = Server::bind(&path).await.unwrap();
    let summary = daemon.run(server, job(dir.path(), "out.webm", 0.0)).await.unwrap();

    assert_eq!(summary.report.completed, 1);
    assert_eq!(summary.exit_code(), 0);
    assert!(dir.path().join("out.webm").exists());
    assert!(!path.exists());
}

#[tokio::test]
async fn job_sent_during_an_encode_is_not_lost() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = FakeFfmpeg::new(dir.path(), ":", "fill 100\nsleep 1\nexit 0", "exit 1");
    let path = dir.path().join("pwebm.sock");

    let daemon = Daemon::with_encoder(Config::default(), ffmpeg.encoder(dir.path(), 10.0));
    let server = Server::bind(&path).await.unwrap();

    let (summary, ()) = tokio::join!(daemon.run(server, job(dir.path(), "first.webm", 0.0)), async {
        wait_for_status(&daemon.status, |s| matches!(s, Status::SecondPass { .. })).await;
        client::enqueue(&path, job(dir.path(), "second.webm", 0.0)).await.unwrap();
    });
    let summary = summary.unwrap();

    assert_eq!(summary.report.completed, 2);
    assert_eq!(daemon.queue.total_count(), 2);
    assert!(dir.path().join("first.webm").exists());
    assert!(dir.path().join("second.webm").exists());

    // the instance is gone, a later launch has to take over
    assert!(daemon.queue.is_closing());
    assert!(matches!(
        client::enqueue(&path, job(dir.path(), "third.webm", 0.0)).await,
        Err(ClientError::NoServer)
    ));
}

#[tokio::test]
async fn ffprobe_output_is_decoded() {
    let dir = TempDir::new().unwrap();
    let ffprobe = write_script(
        dir.path(),
        "ffprobe",
        r#"cat <<'JSON'
{
  "streams": [
    {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "pix_fmt": "yuv420p"},
    {"index": 1, "codec_type": "audio", "codec_name": "aac"}
  ],
  "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "61.440000", "size": "1048576"}
}
JSON"#,
    );

    let prober = FfprobeProber::new(ffprobe);
    let duration = prober.duration(std::path::Path::new("a.mp4")).await.unwrap();
    assert!((duration - 61.44).abs() < 1e-9);

    let failing = write_script(dir.path(), "ffprobe-fail", "echo 'a.mp4: No such file or directory' >&2\nexit 1");
    assert!(FfprobeProber::new(failing).probe(std::path::Path::new("a.mp4")).await.is_err());
}
