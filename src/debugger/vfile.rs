//! File-like access to the remote host's filesystem, implemented entirely in
//! terms of `vFile` transport commands. The debugee image is symbolized from
//! here without ever touching the local disk.

use crate::debugger::error::Error;
use crate::debugger::rsp::{hex_encode, Connection};
use std::io::{Read, Write};

/// An open file on the remote stub's host.
pub struct RemoteFile<'a, T: Read + Write> {
    conn: &'a mut Connection<T>,
    fd: u64,
}

impl<'a, T: Read + Write> RemoteFile<'a, T> {
    pub fn open(conn: &'a mut Connection<T>, filename: &str) -> Result<Self, Error> {
        let resp = conn.exec(&format!("vFile:open:{},0,0", hex_encode(filename.as_bytes())))?;
        let fd = parse_file_resp(&resp, None)?;
        Ok(Self { conn, fd: fd as u64 })
    }

    /// Positioned read into `buf`, returns the byte count declared by the
    /// stub (zero at the end of the file).
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let resp = self.conn.exec(&format!(
            "vFile:pread:{:x},{:x},{:x}",
            self.fd,
            buf.len(),
            offset
        ))?;
        let n = parse_file_resp(&resp, Some(buf))?;
        // a stub may declare more than was asked for, never report past the
        // caller's buffer
        Ok((n.max(0) as usize).min(buf.len()))
    }

    /// Stream the whole file into memory, one packet-sized chunk per round
    /// trip.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        let mut image = Vec::new();
        let mut buf = vec![0u8; self.conn.packet_size()];
        loop {
            let n = self.read_at(&mut buf, image.len() as u64)?;
            if n == 0 {
                return Ok(image);
            }
            image.extend_from_slice(&buf[..n]);
        }
    }

    pub fn close(self) -> Result<(), Error> {
        self.conn.exec(&format!("vFile:close:{:x}", self.fd))?;
        Ok(())
    }
}

/// Parse an `F<n>` or `F<n>;<n bytes>` reply, copying trailing data into
/// `buf` when present.
fn parse_file_resp(resp: &[u8], buf: Option<&mut [u8]>) -> Result<i64, Error> {
    if resp.len() < 2 || resp[0] != b'F' {
        return Err(Error::FileResponse(
            String::from_utf8_lossy(resp).into_owned(),
        ));
    }
    if resp.len() > 2 && resp[1] == b'-' && resp[2] == b'1' {
        return Err(Error::FileOperation(
            String::from_utf8_lossy(resp).into_owned(),
        ));
    }

    let Some(idx) = resp.iter().position(|&b| b == b';') else {
        let n = std::str::from_utf8(&resp[1..])
            .ok()
            .and_then(|s| i64::from_str_radix(s, 16).ok())
            .unwrap_or_default();
        return Ok(n);
    };

    let n = std::str::from_utf8(&resp[1..idx])
        .ok()
        .and_then(|s| i64::from_str_radix(s, 16).ok())
        .unwrap_or_default();
    let data = &resp[idx + 1..];
    if data.len() != n as usize {
        return Err(Error::FileResponseLength(
            String::from_utf8_lossy(resp).into_owned(),
        ));
    }
    if let Some(buf) = buf {
        let count = data.len().min(buf.len());
        buf[..count].copy_from_slice(&data[..count]);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::rsp::testing::{frame, MockStream};

    fn conn() -> (Connection<MockStream>, MockStream) {
        let stream = MockStream::new();
        let mut conn = Connection::new(stream.clone());
        conn.set_ack_mode(false);
        (conn, stream)
    }

    #[test]
    fn test_parse_file_resp() {
        assert_eq!(parse_file_resp(b"F5", None).unwrap(), 5);
        assert_eq!(parse_file_resp(b"F1f", None).unwrap(), 0x1f);
        assert_eq!(parse_file_resp(b"F0", None).unwrap(), 0);

        assert!(matches!(
            parse_file_resp(b"F-1", None),
            Err(Error::FileOperation(_))
        ));
        assert!(matches!(
            parse_file_resp(b"X5", None),
            Err(Error::FileResponse(_))
        ));
        assert!(matches!(
            parse_file_resp(b"F", None),
            Err(Error::FileResponse(_))
        ));

        let mut buf = [0u8; 8];
        assert_eq!(parse_file_resp(b"F3;abc", Some(&mut buf)).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        // declared length does not match the trailing payload
        assert!(matches!(
            parse_file_resp(b"F4;abc", Some(&mut buf)),
            Err(Error::FileResponseLength(_))
        ));
    }

    #[test]
    fn test_open_and_read() {
        let (mut conn, stream) = conn();
        stream.append(frame("F7"));
        let mut file = RemoteFile::open(&mut conn, "/usr/bin/app").unwrap();

        stream.clear_written();
        stream.append(frame("F4;data"));
        let mut buf = [0u8; 4];
        let n = file.read_at(&mut buf, 0x100).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"data");
        assert_eq!(
            stream.written(),
            frame("vFile:pread:7,4,100").as_bytes()
        );

        stream.clear_written();
        stream.append(frame("F0"));
        file.close().unwrap();
        assert_eq!(stream.written(), frame("vFile:close:7").as_bytes());
    }

    #[test]
    fn test_read_reply_longer_than_requested() {
        let (mut conn, stream) = conn();
        stream.append(frame("F7"));
        let mut file = RemoteFile::open(&mut conn, "/usr/bin/app").unwrap();

        // six bytes declared and carried against a four byte read
        stream.append(frame("F6;abcdef"));
        let mut buf = [0u8; 4];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_open_failure() {
        let (mut conn, stream) = conn();
        stream.append(frame("F-1"));
        let err = RemoteFile::open(&mut conn, "/missing").err().unwrap();
        assert!(matches!(err, Error::FileOperation(_)));
    }

    #[test]
    fn test_read_to_end() {
        let (mut conn, stream) = conn();
        stream.append(frame("F2"));
        let mut file = RemoteFile::open(&mut conn, "/usr/bin/app").unwrap();

        stream.append(frame("F4;abcd"));
        stream.append(frame("F2;ef"));
        stream.append(frame("F0"));
        let image = file.read_to_end().unwrap();
        assert_eq!(image, b"abcdef");
    }
}
