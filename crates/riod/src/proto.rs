//! Wire messages for the riod op protocol.
//!
//! A deliberately small 9P-shaped subset: the seven operations the
//! synthetic tree speaks, plus an error reply. Frames are length-delimited
//! (the 4-byte little-endian size counts itself, 9P style); inside a frame:
//! `type[1] tag[2] body`. Strings carry a u16 length prefix, data blobs a
//! u32 prefix, all little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use enum_primitive::*;
use num_traits::FromPrimitive;
use std::io::{self, Read, Write};

enum_from_primitive! {
    #[doc = "Message type octets, numbered after their 9P cousins"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum MsgType {
        TAttach     = 104,
        RAttach,
        RError      = 107,
        TWalk       = 110,
        RWalk,
        TOpen       = 112,
        ROpen,
        TRead       = 116,
        RRead,
        TWrite      = 118,
        RWrite,
        TClunk      = 120,
        RClunk,
    }
}

/// The op payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fcall {
    TAttach,
    RAttach { fid: u32 },
    RError { ename: String },
    TWalk { fid: u32, wnames: Vec<String> },
    RWalk { newfid: u32 },
    TOpen { fid: u32, mode: u8 },
    ROpen,
    TRead { fid: u32, offset: u64, count: u32 },
    RRead { data: Vec<u8> },
    TWrite { fid: u32, offset: u64, data: Vec<u8> },
    RWrite { count: u32 },
    TClunk { fid: u32 },
    RClunk,
}

impl From<&Fcall> for MsgType {
    fn from(fcall: &Fcall) -> MsgType {
        match fcall {
            Fcall::TAttach => MsgType::TAttach,
            Fcall::RAttach { .. } => MsgType::RAttach,
            Fcall::RError { .. } => MsgType::RError,
            Fcall::TWalk { .. } => MsgType::TWalk,
            Fcall::RWalk { .. } => MsgType::RWalk,
            Fcall::TOpen { .. } => MsgType::TOpen,
            Fcall::ROpen => MsgType::ROpen,
            Fcall::TRead { .. } => MsgType::TRead,
            Fcall::RRead { .. } => MsgType::RRead,
            Fcall::TWrite { .. } => MsgType::TWrite,
            Fcall::RWrite { .. } => MsgType::RWrite,
            Fcall::TClunk { .. } => MsgType::TClunk,
            Fcall::RClunk => MsgType::RClunk,
        }
    }
}

/// A tagged message, the unit of one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    pub tag: u16,
    pub body: Fcall,
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_u16::<LittleEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn read_data<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_data<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(data.len() as u32)?;
    w.write_all(data)
}

/// Decode one frame body (everything after the size field).
pub fn read_msg<R: Read>(r: &mut R) -> io::Result<Msg> {
    let typ = r.read_u8()?;
    let typ = MsgType::from_u8(typ)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad type {typ}")))?;
    let tag = r.read_u16::<LittleEndian>()?;

    let body = match typ {
        MsgType::TAttach => Fcall::TAttach,
        MsgType::RAttach => Fcall::RAttach {
            fid: r.read_u32::<LittleEndian>()?,
        },
        MsgType::RError => Fcall::RError {
            ename: read_string(r)?,
        },
        MsgType::TWalk => {
            let fid = r.read_u32::<LittleEndian>()?;
            let count = r.read_u16::<LittleEndian>()? as usize;
            let mut wnames = Vec::with_capacity(count);
            for _ in 0..count {
                wnames.push(read_string(r)?);
            }
            Fcall::TWalk { fid, wnames }
        }
        MsgType::RWalk => Fcall::RWalk {
            newfid: r.read_u32::<LittleEndian>()?,
        },
        MsgType::TOpen => Fcall::TOpen {
            fid: r.read_u32::<LittleEndian>()?,
            mode: r.read_u8()?,
        },
        MsgType::ROpen => Fcall::ROpen,
        MsgType::TRead => Fcall::TRead {
            fid: r.read_u32::<LittleEndian>()?,
            offset: r.read_u64::<LittleEndian>()?,
            count: r.read_u32::<LittleEndian>()?,
        },
        MsgType::RRead => Fcall::RRead {
            data: read_data(r)?,
        },
        MsgType::TWrite => Fcall::TWrite {
            fid: r.read_u32::<LittleEndian>()?,
            offset: r.read_u64::<LittleEndian>()?,
            data: read_data(r)?,
        },
        MsgType::RWrite => Fcall::RWrite {
            count: r.read_u32::<LittleEndian>()?,
        },
        MsgType::TClunk => Fcall::TClunk {
            fid: r.read_u32::<LittleEndian>()?,
        },
        MsgType::RClunk => Fcall::RClunk,
    };

    Ok(Msg { tag, body })
}

/// Encode one frame body (the framing codec prepends the size).
pub fn write_msg<W: Write>(w: &mut W, msg: &Msg) -> io::Result<()> {
    w.write_u8(MsgType::from(&msg.body) as u8)?;
    w.write_u16::<LittleEndian>(msg.tag)?;

    match &msg.body {
        Fcall::TAttach | Fcall::ROpen | Fcall::RClunk => {}
        Fcall::RAttach { fid } => w.write_u32::<LittleEndian>(*fid)?,
        Fcall::RError { ename } => write_string(w, ename)?,
        Fcall::TWalk { fid, wnames } => {
            w.write_u32::<LittleEndian>(*fid)?;
            w.write_u16::<LittleEndian>(wnames.len() as u16)?;
            for name in wnames {
                write_string(w, name)?;
            }
        }
        Fcall::RWalk { newfid } => w.write_u32::<LittleEndian>(*newfid)?,
        Fcall::TOpen { fid, mode } => {
            w.write_u32::<LittleEndian>(*fid)?;
            w.write_u8(*mode)?;
        }
        Fcall::TRead { fid, offset, count } => {
            w.write_u32::<LittleEndian>(*fid)?;
            w.write_u64::<LittleEndian>(*offset)?;
            w.write_u32::<LittleEndian>(*count)?;
        }
        Fcall::RRead { data } => write_data(w, data)?,
        Fcall::TWrite { fid, offset, data } => {
            w.write_u32::<LittleEndian>(*fid)?;
            w.write_u64::<LittleEndian>(*offset)?;
            write_data(w, data)?;
        }
        Fcall::RWrite { count } => w.write_u32::<LittleEndian>(*count)?,
        Fcall::TClunk { fid } => w.write_u32::<LittleEndian>(*fid)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Msg) {
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).unwrap();
        let decoded = read_msg(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn walk_and_write_survive_the_wire() {
        round_trip(Msg {
            tag: 7,
            body: Fcall::TWalk {
                fid: 1,
                wnames: vec!["scene".into(), "parse".into()],
            },
        });
        round_trip(Msg {
            tag: 8,
            body: Fcall::TWrite {
                fid: 3,
                offset: 0,
                data: b"x = 1\n".to_vec(),
            },
        });
        round_trip(Msg {
            tag: 9,
            body: Fcall::RError {
                ename: "parse: not found".into(),
            },
        });
    }

    #[test]
    fn unknown_type_is_invalid_data() {
        let err = read_msg(&mut [0xfeu8, 0, 0].as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
