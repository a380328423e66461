use bytes::Bytes;

use crate::net::{ChannelError, RecvChannel, Serialize};

/// Reset code telling the client its request was rejected.
pub const BAD_REQUEST_CODE: u64 = 42;

/// Longest request line accepted, terminator included.
pub const MAX_COMMAND_LEN: usize = 4096;

const GETN: &str = "GETN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetN { frame_count: u64 },
}

impl Command {
    pub fn frame_count(&self) -> u64 {
        match self {
            Command::GetN { frame_count } => *frame_count,
        }
    }
}

impl Serialize<Command> for Command {
    fn serialize(&self) -> Bytes {
        match self {
            Command::GetN { frame_count } => Bytes::from(format!("{GETN} {frame_count}\r\n")),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed command {0:?}")]
    Malformed(String),
    #[error("invalid frame count {0:?}")]
    InvalidCount(String),
}

impl ProtocolError {
    /// The code the control channel is reset with.
    pub fn code(&self) -> u64 {
        BAD_REQUEST_CODE
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("reading command: {0}")]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub fn encode(frame_count: u64) -> Bytes {
    Command::GetN { frame_count }.serialize()
}

pub fn decode(line: &[u8]) -> Result<Command, ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::Malformed(String::from_utf8_lossy(line).into_owned()))?;
    let text = text.trim_end_matches(['\r', '\n']).trim();

    let Some(count) = text.strip_prefix(GETN) else {
        return Err(ProtocolError::Malformed(text.to_string()));
    };
    let count = count.trim_start();

    match count.parse::<u64>() {
        Ok(frame_count) => Ok(Command::GetN { frame_count }),
        Err(_) => Err(ProtocolError::InvalidCount(count.to_string())),
    }
}

/// Reads one request line from `recv` and decodes it. The line ends at the
/// first `\n` or at end-of-stream, whichever comes first.
pub async fn read_command<R: RecvChannel>(recv: &mut R) -> Result<Command, CommandError> {
    let mut line = Vec::with_capacity(64);
    let mut buf = [0u8; 512];

    while let Some(n) = recv.read(&mut buf).await? {
        line.extend_from_slice(&buf[..n]);

        if let Some(pos) = line.iter().position(|b| *b == b'\n') {
            line.truncate(pos + 1);
            break;
        }
        if line.len() > MAX_COMMAND_LEN {
            break;
        }
    }

    if line.len() > MAX_COMMAND_LEN {
        return Err(ProtocolError::Malformed(format!(
            "request line longer than {MAX_COMMAND_LEN} bytes"
        ))
        .into());
    }

    log::trace!("read request line {:?}", String::from_utf8_lossy(&line));
    Ok(decode(&line)?)
}
