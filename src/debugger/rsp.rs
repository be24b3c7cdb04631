//! Packet layer of the remote serial protocol: framing, checksums,
//! acknowledgments, retransmission and feature negotiation. This layer knows
//! nothing about debugging semantics.

use crate::debugger::error::{Error, MAX_RETRANSMITS};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};

const DEFAULT_PACKET_SIZE: usize = 256;

/// Half-duplex connection to a debug stub. At most one command is in flight
/// at any time, its reply must be consumed before the next one is sent.
pub struct Connection<T: Read + Write> {
    stream: BufReader<T>,
    ack_mode: bool,
    packet_size: usize,
}

/// Reply to a run request, the target stopped and is ready for commands.
#[derive(Debug, Clone, Copy)]
pub struct StopPacket {
    /// Signal number reported by the stop reply, if any.
    pub signal: Option<u8>,
}

/// Process metadata reported by the stub.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
    pub triple: String,
}

/// Target description fetched from the stub's `target.xml`.
#[derive(Debug, Clone)]
pub struct TargetDescription {
    pub arch: String,
}

impl<T: Read + Write> Connection<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream: BufReader::new(stream),
            ack_mode: true,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }

    /// Negotiated maximum packet size.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Initial exchange with a freshly connected stub: acknowledge the
    /// connection, ask to turn per-packet acknowledgments off and adopt the
    /// stub's reported packet size.
    pub fn handshake(&mut self) -> Result<(), Error> {
        self.ack_mode = true;
        self.packet_size = DEFAULT_PACKET_SIZE;

        self.send_ack(true)?;
        self.disable_ack()?;
        let stub = self.get_features("xmlRegisters=i386;multiprocess+")?;
        if let Some(size) = stub.get("PacketSize").and_then(|v| v.parse().ok()) {
            self.packet_size = size;
        }
        Ok(())
    }

    fn disable_ack(&mut self) -> Result<(), Error> {
        let resp = self.exec("QStartNoAckMode")?;
        self.ack_mode = resp != b"OK";
        Ok(())
    }

    /// Query the features supported by the stub, reporting our own in
    /// `features`. The reply is a `;`-separated list of `key=value` pairs and
    /// bare `key+`/`key-` flags.
    pub fn get_features(&mut self, features: &str) -> Result<HashMap<String, String>, Error> {
        let resp = self.exec(&format!("qSupported:{features}"))?;
        let resp = String::from_utf8_lossy(&resp);

        let mut stub = HashMap::new();
        for f in resp.split(';') {
            if let Some((k, v)) = f.split_once('=') {
                stub.insert(k.to_string(), v.to_string());
            } else if let Some(last) = f.chars().last() {
                // bare flag, the trailing char is `+` or `-`
                let (k, v) = f.split_at(f.len() - last.len_utf8());
                stub.insert(k.to_string(), v.to_string());
            }
        }
        Ok(stub)
    }

    /// Ask the stub to run a program, program path and arguments are
    /// hex-encoded on the wire.
    pub fn run(&mut self, program: &str, args: &[String]) -> Result<StopPacket, Error> {
        let mut params = hex_encode(program.as_bytes());
        for arg in args {
            params.push(';');
            params.push_str(&hex_encode(arg.as_bytes()));
        }
        let resp = self.exec(&format!("vRun;{params}"))?;
        stop_reply(&resp)
    }

    /// Chunked read of the whole object identified by `kind`/`annex`. One
    /// round trip per chunk, terminated by an `l`-prefixed reply.
    pub fn qxfer(&mut self, kind: &str, annex: &str) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        loop {
            let resp = self.exec(&format!(
                "qXfer:{kind}:read:{annex}:{:x},{:x}",
                buf.len(),
                self.packet_size
            ))?;
            buf.extend_from_slice(&resp[1..]);
            if resp[0] == b'l' {
                return Ok(buf);
            }
        }
    }

    pub fn get_process_info(&mut self) -> Result<ProcessInfo, Error> {
        let resp = self.exec("qProcessInfo")?;
        Ok(parse_process_info(&resp, 16))
    }

    pub fn get_process_info_pid(&mut self, pid: u32) -> Result<ProcessInfo, Error> {
        let resp = self.exec(&format!("qProcessInfoPID:{pid}"))?;
        Ok(parse_process_info(&resp, 10))
    }

    /// Fetch the target description and extract the architecture name.
    pub fn read_target_features(&mut self) -> Result<TargetDescription, Error> {
        static ARCH_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"<architecture>([^<]+)</architecture>").unwrap());

        let xml = self.qxfer("features", "target.xml")?;
        let xml = String::from_utf8_lossy(&xml);
        let arch = ARCH_RE
            .captures(&xml)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();
        Ok(TargetDescription { arch })
    }

    /// Install a software breakpoint of the given kind at `addr`.
    pub fn insert_breakpoint(&mut self, addr: u64, kind: u32) -> Result<(), Error> {
        self.exec(&format!("Z0,{addr:x},{kind}"))?;
        Ok(())
    }

    /// Send one command and return its decoded reply payload.
    pub fn exec(&mut self, cmd: &str) -> Result<Vec<u8>, Error> {
        self.send(cmd)?;
        self.recv(cmd)
    }

    fn send(&mut self, cmd: &str) -> Result<(), Error> {
        let frame = format!("${cmd}#{:02x}", checksum(cmd.as_bytes()));

        for _ in 0..MAX_RETRANSMITS {
            self.stream.get_mut().write_all(frame.as_bytes())?;

            if !self.ack_mode {
                return Ok(());
            }
            if self.recv_ack()? {
                return Ok(());
            }
        }
        Err(Error::SendRetriesExceeded {
            cmd: trim_cmd(cmd),
        })
    }

    fn recv(&mut self, cmd: &str) -> Result<Vec<u8>, Error> {
        let mut attempt = 0;
        while attempt < MAX_RETRANSMITS {
            let mut raw = Vec::new();
            self.stream.read_until(b'#', &mut raw)?;
            if raw.last() != Some(&b'#') {
                return Err(Error::ConnectionClosed);
            }

            let mut sum_buf = [0u8; 2];
            self.stream.read_exact(&mut sum_buf)?;

            if raw[0] != b'$' {
                // notification or any other non-reply packet, skip it
                continue;
            }

            let payload = &raw[1..raw.len() - 1];
            let sum_field = std::str::from_utf8(&sum_buf)?;
            let sum = u8::from_str_radix(sum_field, 16)
                .map_err(|_| Error::MalformedChecksum(sum_field.to_string()))?;
            let sum_ok = sum == checksum(payload);

            let payload = unescape(payload);

            if !self.ack_mode {
                return if sum_ok {
                    check_for_err(cmd, payload)
                } else {
                    Err(Error::ChecksumMismatch(
                        String::from_utf8_lossy(&payload).into_owned(),
                    ))
                };
            }

            if sum_ok {
                self.send_ack(true)?;
                return check_for_err(cmd, payload);
            }
            self.send_ack(false)?;
            attempt += 1;
        }
        Err(Error::RecvRetriesExceeded {
            cmd: trim_cmd(cmd),
        })
    }

    fn send_ack(&mut self, ack: bool) -> Result<(), Error> {
        let b = if ack { b"+" } else { b"-" };
        self.stream.get_mut().write_all(b)?;
        Ok(())
    }

    fn recv_ack(&mut self) -> Result<bool, Error> {
        let mut b = [0u8; 1];
        self.stream.read_exact(&mut b)?;
        if b[0] != b'+' && b[0] != b'-' {
            return Err(Error::InvalidAck(b[0]));
        }
        Ok(b[0] == b'+')
    }

    #[cfg(test)]
    pub(crate) fn set_ack_mode(&mut self, on: bool) {
        self.ack_mode = on;
    }
}

fn stop_reply(resp: &[u8]) -> Result<StopPacket, Error> {
    match resp.first() {
        Some(b'T') => {
            let signal = resp
                .get(1..3)
                .and_then(|d| std::str::from_utf8(d).ok())
                .and_then(|d| u8::from_str_radix(d, 16).ok());
            Ok(StopPacket { signal })
        }
        _ => Err(Error::UnknownStopReply(
            String::from_utf8_lossy(resp).into_owned(),
        )),
    }
}

/// Detect error-coded replies: an empty payload or an `E` followed by exactly
/// two characters.
fn check_for_err(cmd: &str, resp: Vec<u8>) -> Result<Vec<u8>, Error> {
    if resp.is_empty() {
        return Err(Error::Protocol {
            cmd: trim_cmd(cmd),
            code: "0".to_string(),
        });
    }
    if resp[0] == b'E' && resp.len() == 3 {
        return Err(Error::Protocol {
            cmd: trim_cmd(cmd),
            code: String::from_utf8_lossy(&resp).into_owned(),
        });
    }
    Ok(resp)
}

/// Remove `0x7d` escape markers, the byte following a marker is xor-ed with
/// `0x20` to recover its original value.
fn unescape(packet: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(packet.len());
    let mut i = 0;
    while i < packet.len() {
        match packet[i] {
            0x7d => {
                if i + 1 < packet.len() {
                    buf.push(packet[i + 1] ^ 0x20);
                    i += 1;
                }
            }
            b => buf.push(b),
        }
        // the stub is not expected to use RLE compression
        i += 1;
    }
    buf
}

/// 8-bit truncated sum of the payload bytes.
fn checksum(packet: &[u8]) -> u8 {
    packet.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn trim_cmd(cmd: &str) -> String {
    match cmd.char_indices().nth(10) {
        Some((i, _)) => format!("{}...", &cmd[..i]),
        None => cmd.to_string(),
    }
}

pub(crate) fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn hex_decode(s: &str) -> Vec<u8> {
    s.as_bytes()
        .chunks(2)
        .filter_map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

fn parse_process_info(resp: &[u8], radix: u32) -> ProcessInfo {
    let resp = String::from_utf8_lossy(resp);
    let mut info = ProcessInfo::default();
    for f in resp.split(';') {
        let Some((k, v)) = f.split_once(':') else {
            continue;
        };
        match k {
            "name" => info.name = String::from_utf8_lossy(&hex_decode(v)).into_owned(),
            "pid" => info.pid = u32::from_str_radix(v, radix).unwrap_or_default(),
            "triple" => info.triple = String::from_utf8_lossy(&hex_decode(v)).into_owned(),
            _ => {}
        }
    }
    info
}
