//! Jet-vane rocket flight computer core: ground telemetry framing, command
//! handling and SD/NOR-flash data logging.

pub mod channel;
pub mod command;
pub mod config;
pub mod constants;
pub mod crc;
pub mod format;
pub mod protocol;
pub mod reader;
pub mod recorder;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use self::channel::{Channel, ChannelSpec, Direction};
pub use self::command::{Command, CommandDispatcher, CommandHandler, FlightCommands, Signal};
pub use self::config::Config;
pub use self::protocol::{Frame, FrameError, Message};
pub use self::reader::FrameReader;
pub use self::recorder::StateRecorder;
pub use self::state::{RocketState, SharedState};
pub use self::telemetry::{StateTx, TelemetryLink};
pub use self::transport::Transport;
pub use self::worker::{IoError, IoHandle, OperationKind, PeriphIo, Ticket};
