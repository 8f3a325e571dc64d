pub mod command;
pub mod parser;
pub mod types;
pub mod writer;

pub use command::{Command, IntoArg};
pub use parser::{decode_slice, Decoder};
pub use types::Reply;
pub use writer::{encode_batch, encode_command, encode_reply};
