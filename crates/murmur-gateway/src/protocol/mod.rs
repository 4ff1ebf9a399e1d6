//! Gateway wire protocol: opcodes, close codes and payload builders.

mod close;
mod opcode;
mod payload;

pub use close::{CloseBehavior, CloseCode};
pub use opcode::OpCode;
pub use payload::{
    GatewayPacket, GuildMembersChunk, Hello, Ready, StatusUpdate, build_heartbeat, build_identify,
    build_presence_update, build_request_members, build_resume, build_voice_state, intents,
};
