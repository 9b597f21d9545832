use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use jetvane::command::Signal;
use jetvane::recorder::{self, CSV_FILE, SELF_TEST_FILE, StateRecorder};
use jetvane::state::{RocketState, SharedState};
use jetvane::storage::{NorFlash, RamFlash, SdCard};
use jetvane::worker::{IoHandle, PeriphIo};

fn temp_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("jetvane-rec-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn spawn(root: &PathBuf) -> IoHandle {
    let flash = NorFlash::new(RamFlash::new(8, 4096));
    let (io, _worker) = PeriphIo::new(SdCard::new(root), flash).spawn().unwrap();
    io
}

fn state_at(launch: u64) -> RocketState {
    let mut state = RocketState::default();
    state.launch_timestamp = launch;
    state.state_vector.timestamp = launch as u32 * 10;
    state.state_vector.attitude_w = 1.0;
    state.flight_state.state = 2;
    state
}

fn csv_lines(root: &PathBuf) -> Vec<String> {
    fs::read_to_string(root.join(CSV_FILE))
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

#[test]
fn test_self_tests_pass_and_clean_up() {
    let root = temp_root("self-test");
    let io = spawn(&root);

    recorder::self_test_flash(&io).unwrap();
    recorder::self_test_sd(&io).unwrap();
    assert!(!root.join(SELF_TEST_FILE).exists());

    // Channels are released, the recorder can take the same ids
    StateRecorder::new(&io).unwrap();
}

#[test]
fn test_sd_self_test_ignores_stale_file() {
    let root = temp_root("stale");
    fs::write(root.join(SELF_TEST_FILE), b"left over").unwrap();
    let io = spawn(&root);
    recorder::self_test_sd(&io).unwrap();
}

#[test]
fn test_record_then_offload_csv() {
    let root = temp_root("offload");
    let io = spawn(&root);
    let mut recorder = StateRecorder::new(&io).unwrap();

    for launch in 1..=3 {
        recorder.record(&state_at(launch)).unwrap();
    }
    assert_eq!(recorder.n_states(), 3);
    assert_eq!(recorder.recorded_states().unwrap(), 3);

    let mut progress = Vec::new();
    let written = recorder
        .offload(3, |done, total| progress.push((done, total)))
        .unwrap();
    assert_eq!(progress, [(1, 3), (2, 3), (3, 3)]);

    let lines = csv_lines(&root);
    assert_eq!(written, lines.iter().map(|l| l.len() + 1).sum::<usize>());
    assert_eq!(lines.len(), 3);
    for (i, line) in lines.iter().enumerate() {
        let cols: Vec<&str> = line.split(',').collect();
        assert_eq!(cols.len(), 48);
        assert_eq!(cols[0], (i + 1).to_string());
        assert_eq!(cols[1], ((i + 1) * 10).to_string());
        assert_eq!(cols[5], "1.000000");
        assert_eq!(cols[21], "2");
    }
}

#[test]
fn test_run_records_until_offload_signal() {
    let root = temp_root("run");
    let io = spawn(&root);
    let recorder = StateRecorder::new(&io).unwrap();
    let state = SharedState::new(state_at(42));
    let (signals_tx, signals) = mpsc::channel();

    signals_tx.send(Signal::BeginStateFlash).unwrap();
    let sender = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        signals_tx.send(Signal::FlashSdCard).unwrap();
    });

    let n_states = recorder
        .run(&state, &signals, Duration::from_millis(5), |_, _| {})
        .unwrap();
    sender.join().unwrap();

    assert!(n_states >= 1);
    let lines = csv_lines(&root);
    assert_eq!(lines.len(), n_states);
    assert!(lines.iter().all(|l| l.starts_with("42,420,")));
}

#[test]
fn test_run_waits_for_begin() {
    let root = temp_root("idle");
    let io = spawn(&root);
    let recorder = StateRecorder::new(&io).unwrap();
    let (signals_tx, signals) = mpsc::channel::<Signal>();
    drop(signals_tx);

    let n_states = recorder
        .run(&SharedState::default(), &signals, Duration::from_millis(5), |_, _| {})
        .unwrap();
    assert_eq!(n_states, 0);
    assert!(!root.join(CSV_FILE).exists());
}
