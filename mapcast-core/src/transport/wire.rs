//! Bulk-transport wire framing (C8, TCP variant): commands encoded as
//! `{u8 cmd}{u16 arg_len be}{arg_bytes}`, responses as `{u8 status}` with
//! an optional 8-byte size header and raw payload (spec §6 "Bulk-
//! transport wire format").

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MapcastError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Hello = 1,
    Ping = 2,
    List = 3,
    Get = 4,
    Put = 5,
    Delete = 6,
}

impl Cmd {
    fn from_u8(v: u8) -> Option<Self> {
        use Cmd::*;
        Some(match v {
            1 => Hello,
            2 => Ping,
            3 => List,
            4 => Get,
            5 => Put,
            6 => Delete,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Err = 1,
    Welcome = 2,
    Pong = 3,
}

impl Status {
    fn from_u8(v: u8) -> Option<Self> {
        use Status::*;
        Some(match v {
            0 => Ok,
            1 => Err,
            2 => Welcome,
            3 => Pong,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cmd: Cmd,
    pub arg: Vec<u8>,
}

impl Command {
    pub fn new(cmd: Cmd, arg: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd,
            arg: arg.into(),
        }
    }

    pub fn bare(cmd: Cmd) -> Self {
        Self {
            cmd,
            arg: Vec::new(),
        }
    }

    pub fn arg_str(&self) -> String {
        String::from_utf8_lossy(&self.arg).to_string()
    }
}

pub async fn write_command<W: AsyncWrite + Unpin>(w: &mut W, command: &Command) -> Result<()> {
    let arg_len: u16 = command
        .arg
        .len()
        .try_into()
        .map_err(|_| MapcastError::MalformedFrame("command argument too large".into()))?;
    w.write_u8(command.cmd as u8).await?;
    w.write_u16(arg_len).await?;
    if !command.arg.is_empty() {
        w.write_all(&command.arg).await?;
    }
    Ok(())
}

pub async fn read_command<R: AsyncRead + Unpin>(r: &mut R) -> Result<Command> {
    let cmd_byte = r.read_u8().await?;
    let cmd = Cmd::from_u8(cmd_byte)
        .ok_or_else(|| MapcastError::MalformedFrame(format!("unknown command byte {cmd_byte}")))?;
    let arg_len = r.read_u16().await? as usize;
    let mut arg = vec![0u8; arg_len];
    if arg_len > 0 {
        r.read_exact(&mut arg).await?;
    }
    Ok(Command { cmd, arg })
}

pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, status: Status) -> Result<()> {
    w.write_u8(status as u8).await?;
    Ok(())
}

pub async fn read_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<Status> {
    let b = r.read_u8().await?;
    Status::from_u8(b).ok_or_else(|| MapcastError::MalformedFrame(format!("unknown status byte {b}")))
}

pub async fn write_port<W: AsyncWrite + Unpin>(w: &mut W, port: u16) -> Result<()> {
    w.write_u16(port).await?;
    Ok(())
}

pub async fn read_port<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16> {
    Ok(r.read_u16().await?)
}

pub async fn write_sized_payload<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    w.write_u64(payload.len() as u64).await?;
    w.write_all(payload).await?;
    Ok(())
}

pub async fn read_sized_payload<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let size = r.read_u64().await? as usize;
    let mut buf = vec![0u8; size];
    if size > 0 {
        r.read_exact(&mut buf).await?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn command_round_trips() {
        let (mut a, mut b) = duplex(256);
        let command = Command::new(Cmd::Get, b"videos/show.mp4".to_vec());
        write_command(&mut a, &command).await.unwrap();
        let decoded = read_command(&mut b).await.unwrap();
        assert_eq!(decoded, command);
        assert_eq!(decoded.arg_str(), "videos/show.mp4");
    }

    #[tokio::test]
    async fn status_round_trips() {
        let (mut a, mut b) = duplex(16);
        write_status(&mut a, Status::Welcome).await.unwrap();
        assert_eq!(read_status(&mut b).await.unwrap(), Status::Welcome);
    }

    #[tokio::test]
    async fn sized_payload_round_trips() {
        let (mut a, mut b) = duplex(1024);
        let payload = b"file bytes go here".to_vec();
        write_sized_payload(&mut a, &payload).await.unwrap();
        let decoded = read_sized_payload(&mut b).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn bare_command_has_empty_arg() {
        let (mut a, mut b) = duplex(16);
        write_command(&mut a, &Command::bare(Cmd::Ping)).await.unwrap();
        let decoded = read_command(&mut b).await.unwrap();
        assert_eq!(decoded.cmd, Cmd::Ping);
        assert!(decoded.arg.is_empty());
    }
}
