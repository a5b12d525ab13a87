//! Scripted peers for connection unit tests.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use respio_engine::EngineContext;

use crate::connection::{DirectConnection, DirectOptions};

/// Direct connection over one end of a socket pair; the other end is the peer.
pub(crate) fn direct_pair(options: DirectOptions) -> (DirectConnection, UnixStream) {
    let (client, server) = UnixStream::pair().expect("pair");
    let conn = DirectConnection::new(client, EngineContext::default(), options).expect("conn");
    (conn, server)
}

/// Reads one RESP array-of-bulk-strings request.
pub(crate) fn read_command<R: BufRead>(reader: &mut R) -> io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_len(&line)?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_until(b'\n', &mut line)?;
        let len = parse_len(&line)?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        data.truncate(len);
        args.push(data);
    }
    Ok(args)
}

fn parse_len(line: &[u8]) -> io::Result<usize> {
    std::str::from_utf8(&line[1..line.len().saturating_sub(2)])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "length"))
}

/// Answers `count` requests, replying to each with its last argument as a bulk string.
pub(crate) fn echo_peer(stream: UnixStream, count: usize) -> JoinHandle<Vec<Vec<u8>>> {
    thread::spawn(move || {
        let mut writer = stream.try_clone().expect("clone");
        let mut reader = BufReader::new(stream);
        let mut seen = Vec::with_capacity(count);
        for _ in 0..count {
            let args = read_command(&mut reader).expect("request");
            let last = args.last().cloned().unwrap_or_default();
            let mut reply = format!("${}\r\n", last.len()).into_bytes();
            reply.extend_from_slice(&last);
            reply.extend_from_slice(b"\r\n");
            writer.write_all(&reply).expect("reply");
            seen.push(last);
        }
        seen
    })
}
