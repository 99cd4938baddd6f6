//! End-to-end tests: the reference uploader against a real server, directly
//! and through the lossy relay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::oneshot;

use abp_transfer::config::ServerConfig;
use abp_transfer::packet::Bit;
use abp_transfer::registry::AdmissionPolicy;
use abp_transfer::server::{Server, ShutdownReport};
use abp_transfer::simulator::{Simulator, SimulatorConfig};
use abp_transfer::socket::Socket;
use abp_transfer::store::OutputPolicy;
use abp_transfer::timer::TimerConfig;
use abp_transfer::uploader::{UploadConfig, UploadError, Uploader};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SEGMENT: usize = 100;

fn scratch_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("abp-upload-{tag}-{:016x}", rand::random::<u64>()))
}

async fn serve(
    dir: &Path,
    max_sessions: usize,
) -> (
    SocketAddr,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<ShutdownReport>,
) {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        max_sessions,
        segment_size: SEGMENT,
        admission: AdmissionPolicy::Permissive,
        output: OutputPolicy::Confined(dir.to_path_buf()),
    };
    let server = Server::bind(&config).await.expect("bind server");
    let addr = server.local_addr();
    let (stop, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run(async move {
                let _ = rx.await;
            })
            .await
            .expect("server failed")
    });
    (addr, stop, task)
}

async fn uploader(server: SocketAddr, timer: TimerConfig) -> Uploader {
    let socket = Socket::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind uploader socket");
    Uploader::new(
        socket,
        server,
        UploadConfig {
            segment_size: SEGMENT,
            timer,
        },
    )
}

fn fast_timer(max_retries: u32) -> TimerConfig {
    TimerConfig {
        initial_rto: Duration::from_millis(50),
        min_rto: Duration::from_millis(50),
        max_rto: Duration::from_millis(200),
        max_retries,
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_over_clean_path() {
    let dir = scratch_dir("clean");
    let (addr, stop, task) = serve(&dir, 10).await;
    let contents = random_bytes(1_050);

    let mut up = uploader(addr, fast_timer(5)).await;
    let report = tokio::time::timeout(Duration::from_secs(10), up.upload("clean.bin", &contents))
        .await
        .expect("upload timed out")
        .expect("upload failed");

    assert_eq!(report.segments, 11);
    assert_eq!(report.bytes, 1_050);

    let _ = stop.send(());
    let shutdown = task.await.unwrap();
    assert_eq!(shutdown.metrics.completed, 1);
    assert_eq!(std::fs::read(dir.join("clean.bin")).unwrap(), contents);
    let _ = std::fs::remove_dir_all(&dir);
}

/// Both starting bits produce the same file.
#[tokio::test]
async fn either_initial_bit_works() {
    let dir = scratch_dir("bits");
    let (addr, stop, task) = serve(&dir, 10).await;

    for (bit, name) in [(Bit::Zero, "zero"), (Bit::One, "one")] {
        let mut up = uploader(addr, fast_timer(5)).await;
        up.upload_from(bit, name, b"alternating bit")
            .await
            .expect("upload failed");
        assert_eq!(std::fs::read(dir.join(name)).unwrap(), b"alternating bit");
    }

    let _ = stop.send(());
    assert_eq!(task.await.unwrap().metrics.completed, 2);
    let _ = std::fs::remove_dir_all(&dir);
}

/// Loss and duplication on the way to the server are repaired by
/// retransmission and duplicate detection.
#[tokio::test]
async fn upload_survives_lossy_path() {
    let dir = scratch_dir("lossy");
    let (addr, stop, task) = serve(&dir, 10).await;
    let sim = Simulator::spawn(
        addr,
        SimulatorConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.2,
            faults_downstream: false,
            seed: 0x5eed,
        },
    )
    .await
    .expect("spawn relay");
    let contents = random_bytes(2_000);

    let mut up = uploader(sim.local_addr, fast_timer(30)).await;
    let report = tokio::time::timeout(Duration::from_secs(60), up.upload("lossy.bin", &contents))
        .await
        .expect("upload timed out")
        .expect("upload failed");

    assert_eq!(report.segments, 20);
    assert!(report.retransmissions >= sim.stats().dropped.load(Ordering::Relaxed));

    let _ = stop.send(());
    let shutdown = task.await.unwrap();
    assert_eq!(shutdown.metrics.completed, 1);
    assert_eq!(shutdown.abandoned_sessions, 0);
    assert_eq!(std::fs::read(dir.join("lossy.bin")).unwrap(), contents);
    let _ = std::fs::remove_dir_all(&dir);
}

/// `max_sessions = 1` means every handshake reaches the cap.
#[tokio::test]
async fn refused_handshake_fails_the_upload() {
    let dir = scratch_dir("refused");
    let (addr, stop, task) = serve(&dir, 1).await;

    let mut up = uploader(addr, fast_timer(5)).await;
    let err = up.upload("nope", b"data").await.unwrap_err();
    assert!(matches!(err, UploadError::Refused(_)), "got {err:?}");

    let _ = stop.send(());
    assert_eq!(task.await.unwrap().metrics.rejected_handshakes, 1);
}

#[tokio::test]
async fn silent_server_times_out() {
    // Bound but never read: every send goes unanswered.
    let silent = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let mut up = uploader(silent.local_addr, fast_timer(2)).await;
    let err = up.upload("void", b"data").await.unwrap_err();
    assert!(
        matches!(err, UploadError::Timeout { attempts: 3, .. }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn upload_file_uses_the_file_name() {
    let dir = scratch_dir("file");
    let src_dir = scratch_dir("src");
    std::fs::create_dir_all(&src_dir).unwrap();
    let path = src_dir.join("notes.txt");
    std::fs::write(&path, b"line one\nline two\n").unwrap();

    let (addr, stop, task) = serve(&dir, 10).await;
    let mut up = uploader(addr, fast_timer(5)).await;
    let report = up.upload_file(&path, None).await.expect("upload failed");
    assert_eq!(report.bytes, 18);

    let _ = stop.send(());
    task.await.unwrap();
    assert_eq!(
        std::fs::read(dir.join("notes.txt")).unwrap(),
        b"line one\nline two\n"
    );
    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::remove_dir_all(&src_dir);
}

#[tokio::test]
async fn empty_file_is_a_handshake_only() {
    let dir = scratch_dir("emptyup");
    let (addr, stop, task) = serve(&dir, 10).await;

    let mut up = uploader(addr, fast_timer(5)).await;
    let report = up.upload("empty", b"").await.expect("upload failed");
    assert_eq!(report.segments, 0);

    let _ = stop.send(());
    task.await.unwrap();
    assert_eq!(std::fs::read(dir.join("empty")).unwrap(), b"");
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_input_file_is_reported() {
    let mut up = uploader("127.0.0.1:9".parse().unwrap(), fast_timer(1)).await;
    let err = up
        .upload_file(&scratch_dir("missing").join("nothing"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Read { .. }), "got {err:?}");
}
