//! Ground telemetry: queued downlink, command uplink and the state producer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::command::{CommandDispatcher, CommandHandler, Dispatch};
use crate::constants::{MAX_MESSAGES_QUEUED, MAX_PACKET_SIZE_TELEMETRY};
use crate::protocol::Message;
use crate::reader::FrameReader;
use crate::state::{Section, SharedState};
use crate::transport::Transport;

/// Producer side of the outbound message queue.
#[derive(Clone)]
pub struct Downlink {
    tx: SyncSender<Message>,
}

/// Creates the outbound queue shared by every telemetry producer.
pub fn downlink() -> (Downlink, Receiver<Message>) {
    let (tx, rx) = mpsc::sync_channel(MAX_MESSAGES_QUEUED);
    (Downlink { tx }, rx)
}

impl Downlink {
    /// Queues a message, waiting for room.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| anyhow::format_err!("telemetry link closed"))
    }

    /// Queues a message if there is room right now.
    pub fn try_send(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(m)) => {
                log::debug!("Downlink full, dropping {:?}", m);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: usize,
    pub frames_received: usize,
    pub corrupt_frames: usize,
    pub commands: usize,
}

/// Moves queued messages onto the link and commands off it.
pub struct TelemetryLink<T, H> {
    transport: T,
    reader: FrameReader,
    dispatcher: CommandDispatcher<H>,
    outbound: Receiver<Message>,
    stats: LinkStats,
}

impl<T: Transport, H: CommandHandler> TelemetryLink<T, H> {
    pub fn new(transport: T, handler: H, outbound: Receiver<Message>) -> Self {
        TelemetryLink {
            transport,
            reader: FrameReader::new(),
            dispatcher: CommandDispatcher::new(handler),
            outbound,
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<H> {
        &self.dispatcher
    }

    /// Flushes the outbound queue, then handles whatever arrived within one
    /// poll interval. Returns `false` once every [`Downlink`] is gone.
    pub fn poll(&mut self) -> Result<bool> {
        loop {
            match self.outbound.try_recv() {
                Ok(message) => {
                    self.transport.send_message(&message)?;
                    self.stats.frames_sent += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(false),
            }
        }

        let mut buf = [0u8; MAX_PACKET_SIZE_TELEMETRY];
        let n = self.transport.recv_raw(&mut buf)?;
        if n > 0 {
            log::trace!("<= {}", hex::encode(&buf[..n]));
            self.handle_bytes(&buf[..n])?;
        }
        Ok(true)
    }

    fn handle_bytes(&mut self, data: &[u8]) -> Result<()> {
        let mut acks = Vec::new();
        for result in self.reader.iter_messages(data) {
            match result {
                Ok(message) => {
                    self.stats.frames_received += 1;
                    let outcome = self.dispatcher.dispatch(&message, |ack| acks.push(ack));
                    if matches!(outcome, Dispatch::Executed { .. }) {
                        self.stats.commands += 1;
                    }
                }
                Err(e) => {
                    self.stats.corrupt_frames += 1;
                    log::debug!("Dropping frame: {}", e);
                }
            }
        }
        // Acks skip the queue, it is drained by this same loop
        for ack in acks {
            self.transport.send_message(&ack)?;
            self.stats.frames_sent += 1;
        }
        Ok(())
    }

    pub fn run(mut self) -> Result<LinkStats> {
        while self.poll()? {}
        log::debug!("Telemetry link stopped: {:?}", self.stats);
        Ok(self.stats)
    }
}

/// Streams the shared state to the ground, one message per section.
pub struct StateTx {
    state: SharedState,
    downlink: Downlink,
    epoch: Instant,
}

impl StateTx {
    pub fn new(state: SharedState, downlink: Downlink) -> Self {
        StateTx {
            state,
            downlink,
            epoch: Instant::now(),
        }
    }

    fn send_section<S: Section>(&self, mut section: S, now: u32) -> Result<()> {
        *section.timestamp_mut() = now;
        self.downlink.send(section.to_message()?)
    }

    /// Sends one snapshot. The ground filter covariance only goes out while
    /// the rocket is on the pad. Returns the number of messages queued.
    pub fn send_snapshot(&self) -> Result<usize> {
        let snapshot = self.state.snapshot();
        let now = self.epoch.elapsed().as_millis() as u32;

        self.send_section(snapshot.state_vector, now)?;
        self.send_section(snapshot.servo_deflection, now)?;
        self.send_section(snapshot.flight_state, now)?;
        let mut sent = 3;
        if snapshot.is_on_pad() {
            self.send_section(snapshot.ground_ekf, now)?;
            sent += 1;
        }
        self.send_section(snapshot.sensor_data, now)?;
        self.send_section(snapshot.analog_feedback, now)?;
        Ok(sent + 2)
    }

    /// Sends a snapshot every `period` while `started` is set, until `stop`.
    pub fn run(&self, period: Duration, started: &AtomicBool, stop: &AtomicBool) -> Result<()> {
        let mut announced = false;
        while !stop.load(Ordering::Relaxed) {
            if started.load(Ordering::Relaxed) {
                if !announced {
                    log::info!("Beginning state telemetry");
                    announced = true;
                }
                self.send_snapshot()?;
            }
            std::thread::sleep(period);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::constants::message_ids;
    use crate::protocol::encode;
    use crate::state::FLIGHT_STATE_PAD;
    use crate::transport::pipe;

    fn collect_messages(ground: &mut impl Transport) -> Vec<Message> {
        let mut reader = FrameReader::<{ crate::constants::MAX_FRAME_LEN }>::new();
        let mut buf = [0u8; 512];
        let mut messages = Vec::new();
        loop {
            // The flight end may already be gone
            let n = match ground.recv_raw(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            messages.extend(reader.iter_messages(&buf[..n]).map(|m| m.unwrap()));
        }
        messages
    }

    #[test]
    fn test_command_is_acked_and_executed_once() {
        let (flight, mut ground) = pipe();
        let (_downlink, outbound) = downlink();
        let mut executed = Vec::new();
        let mut link = TelemetryLink::new(flight, |c: Command| executed.push(c), outbound);

        let command = encode(&[0x03, 42], message_ids::COMMAND).unwrap();
        ground.send_raw(command.as_slice()).unwrap();
        ground.send_raw(command.as_slice()).unwrap();
        assert!(link.poll().unwrap());
        assert!(link.poll().unwrap());

        let stats = link.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.commands, 1);
        drop(link);

        assert_eq!(executed, [Command::FlashSdCard]);
        let acks = collect_messages(&mut ground);
        assert_eq!(acks, [Message::new(message_ids::COMMAND_ACK, vec![0x03, 42])]);
    }

    #[test]
    fn test_corrupt_uplink_is_counted_and_ignored() {
        let (flight, mut ground) = pipe();
        let (_downlink, outbound) = downlink();
        let mut link = TelemetryLink::new(flight, |_: Command| panic!("must not run"), outbound);

        let mut raw = encode(&[0x01, 7], message_ids::COMMAND)
            .unwrap()
            .as_slice()
            .to_vec();
        raw[5] ^= 0x01;
        ground.send_raw(&raw).unwrap();
        link.poll().unwrap();

        assert_eq!(link.stats().corrupt_frames, 1);
        assert!(!link.dispatcher().is_seen(7));
    }

    #[test]
    fn test_downlink_drains_in_order_and_stops() {
        let (flight, mut ground) = pipe();
        let (downlink, outbound) = downlink();
        let link = TelemetryLink::new(flight, |_: Command| {}, outbound);

        downlink.send(Message::new(0x21, vec![1])).unwrap();
        downlink.send(Message::new(0x22, vec![])).unwrap();
        drop(downlink);

        let stats = link.run().unwrap();
        assert_eq!(stats.frames_sent, 2);
        let ids: Vec<u8> = collect_messages(&mut ground).iter().map(|m| m.id).collect();
        assert_eq!(ids, [0x21, 0x22]);
    }

    #[test]
    fn test_downlink_try_send_when_full() {
        let (downlink, _outbound) = downlink();
        for i in 0..MAX_MESSAGES_QUEUED {
            assert!(downlink.try_send(Message::new(1, vec![i as u8])));
        }
        assert!(!downlink.try_send(Message::new(1, vec![])));
    }

    #[test]
    fn test_state_tx_skips_ground_ekf_in_flight() {
        let state = SharedState::default();
        let (downlink, outbound) = downlink();
        let tx = StateTx::new(state.clone(), downlink);

        let collect = |outbound: &Receiver<Message>| -> Vec<u8> {
            outbound.try_iter().map(|m| m.id).collect()
        };

        // Queue holds four messages, drain from a second thread
        let sender = std::thread::spawn(move || {
            let on_pad = {
                state.update(|s| s.flight_state.state = FLIGHT_STATE_PAD);
                tx.send_snapshot().unwrap()
            };
            state.update(|s| s.flight_state.state = 3);
            let in_flight = tx.send_snapshot().unwrap();
            (on_pad, in_flight)
        });
        let mut ids = Vec::new();
        while ids.len() < 11 {
            ids.extend(collect(&outbound));
            std::thread::yield_now();
        }
        let (on_pad, in_flight) = sender.join().unwrap();

        assert_eq!((on_pad, in_flight), (6, 5));
        assert_eq!(
            ids,
            [
                message_ids::STATE_VECTOR,
                message_ids::SERVO_DEFLECTION,
                message_ids::FLIGHT_STATE,
                message_ids::GROUND_EKF,
                message_ids::SENSOR_DATA,
                message_ids::ANALOG_FEEDBACK,
                message_ids::STATE_VECTOR,
                message_ids::SERVO_DEFLECTION,
                message_ids::FLIGHT_STATE,
                message_ids::SENSOR_DATA,
                message_ids::ANALOG_FEEDBACK,
            ]
        );
    }
}
