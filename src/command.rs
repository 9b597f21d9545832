//! Ground command handling.
//!
//! A command frame carries `[command_id, uuid]`. The uuid is a wrapping
//! sequence number chosen by the ground station; a command is executed and
//! acknowledged the first time its uuid is seen and silently dropped after
//! that, so the ground can blindly retransmit over a lossy link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use num_enum::TryFromPrimitive;

use crate::constants::{message_ids, notification_bits};
use crate::protocol::Message;

/// Commands the flight computer accepts from the ground.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Leave idle: start state recording, state telemetry and ADC sampling.
    IdleToGround = 0x01,
    FirePyro = 0x02,
    /// Copy every recorded state from flash to the SD card, then stop.
    FlashSdCard = 0x03,
    RunVaneActivationTest = 0x04,
}

/// Executes commands on behalf of the dispatcher.
pub trait CommandHandler {
    fn handle(&mut self, command: Command);
}

impl<F: FnMut(Command)> CommandHandler for F {
    fn handle(&mut self, command: Command) {
        self(command)
    }
}

/// Signals raised by ground commands for the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    BeginStateFlash,
    FlashSdCard,
}

impl Signal {
    pub fn bit(self) -> u32 {
        match self {
            Signal::BeginStateFlash => notification_bits::BEGIN_STATE_FLASH,
            Signal::FlashSdCard => notification_bits::FLASH_SD_CARD,
        }
    }
}

/// Command handler of the flight computer.
pub struct FlightCommands {
    recorder: Sender<Signal>,
    state_tx: Option<Arc<AtomicBool>>,
}

impl FlightCommands {
    pub fn new(recorder: Sender<Signal>) -> Self {
        FlightCommands {
            recorder,
            state_tx: None,
        }
    }

    /// Raises `flag` on leaving idle, to start the state telemetry.
    pub fn start_state_tx(mut self, flag: Arc<AtomicBool>) -> Self {
        self.state_tx = Some(flag);
        self
    }

    fn signal(&self, signal: Signal) {
        if self.recorder.send(signal).is_err() {
            log::warn!("Recorder is not running, {:?} dropped", signal);
        }
    }
}

impl CommandHandler for FlightCommands {
    fn handle(&mut self, command: Command) {
        match command {
            Command::IdleToGround => {
                log::info!("Leaving idle, starting state recording");
                self.signal(Signal::BeginStateFlash);
                if let Some(flag) = &self.state_tx {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            Command::FlashSdCard => {
                log::info!("Offloading flash to SD card");
                self.signal(Signal::FlashSdCard);
            }
            // Pyro and vane actuation are driven by the control loop
            Command::FirePyro | Command::RunVaneActivationTest => {
                log::info!("{:?} has no effect in this build", command);
            }
        }
    }
}

/// Outcome of offering a message to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Not a command frame.
    Ignored,
    /// Command frame too short to carry an id and uuid.
    Malformed,
    /// Uuid already executed.
    Duplicate { uuid: u8 },
    /// Acknowledged; `command` is `None` for an unknown command id.
    Executed {
        command_id: u8,
        uuid: u8,
        command: Option<Command>,
    },
}

/// Deduplicates, acknowledges and executes ground commands.
pub struct CommandDispatcher<H> {
    seen: [bool; 256],
    handler: H,
}

impl<H: CommandHandler> CommandDispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self {
            seen: [false; 256],
            handler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_seen(&self, uuid: u8) -> bool {
        self.seen[uuid as usize]
    }

    /// Handles one decoded message. `ack` is called with the acknowledgment
    /// before the command runs.
    pub fn dispatch(&mut self, message: &Message, mut ack: impl FnMut(Message)) -> Dispatch {
        if message.id != message_ids::COMMAND {
            return Dispatch::Ignored;
        }

        let [command_id, uuid, ..] = message.payload[..] else {
            log::warn!("Command frame too short: {:?}", message);
            return Dispatch::Malformed;
        };

        if self.seen[uuid as usize] {
            log::debug!("Dropping duplicate command {command_id:#04x} (uuid {uuid})");
            return Dispatch::Duplicate { uuid };
        }
        self.seen[uuid as usize] = true;

        log::info!("Command ID: {command_id}, Command UUID: {uuid}");
        ack(Message::new(message_ids::COMMAND_ACK, vec![command_id, uuid]));

        let command = Command::try_from(command_id).ok();
        match command {
            Some(command) => self.handler.handle(command),
            None => log::warn!("Unknown command id {command_id:#04x}"),
        }

        Dispatch::Executed {
            command_id,
            uuid,
            command,
        }
    }
}
