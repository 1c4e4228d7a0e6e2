//! Scripted in-memory streams for protocol dialogue tests.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use super::transport::Dialer;
use super::{ProtocolError, Result};

/// One thing the scripted server does when read from.
#[derive(Debug)]
pub enum Step {
    /// Bytes handed out across as many reads as the client makes.
    Data(Vec<u8>),
    /// One read fails with this kind; later steps still play.
    Fail(io::ErrorKind),
}

impl Step {
    pub fn text(s: impl Into<String>) -> Self {
        Step::Data(s.into().into_bytes())
    }
}

enum Playing {
    Data(Cursor<Vec<u8>>),
    Fail(io::ErrorKind),
}

/// Replays canned server output and records everything the client writes.
///
/// Once every step has played, reads return end of stream.
pub struct ScriptedStream {
    steps: VecDeque<Playing>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedStream {
    pub fn new(server: impl Into<Vec<u8>>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = Self::from_steps(vec![Step::Data(server.into())], written.clone());
        (stream, written)
    }

    fn from_steps(steps: Vec<Step>, written: Arc<Mutex<Vec<u8>>>) -> Self {
        Self {
            steps: steps
                .into_iter()
                .map(|step| match step {
                    Step::Data(bytes) => Playing::Data(Cursor::new(bytes)),
                    Step::Fail(kind) => Playing::Fail(kind),
                })
                .collect(),
            written,
        }
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.steps.front_mut() {
                None => return Ok(0),
                Some(Playing::Fail(kind)) => {
                    let kind = *kind;
                    self.steps.pop_front();
                    return Err(io::Error::new(kind, "scripted failure"));
                }
                Some(Playing::Data(cursor)) => {
                    let n = cursor.read(buf)?;
                    if n > 0 || buf.is_empty() {
                        return Ok(n);
                    }
                    self.steps.pop_front();
                }
            }
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hands out one scripted session per `dial`.
pub struct ScriptDialer {
    sessions: Mutex<VecDeque<Vec<Step>>>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptDialer {
    pub fn new(sessions: Vec<String>) -> Self {
        Self::with_steps(sessions.into_iter().map(|s| vec![Step::text(s)]).collect())
    }

    pub fn single(session: impl Into<String>) -> Self {
        Self::new(vec![session.into()])
    }

    /// Sessions that may fail part way through.
    pub fn with_steps(sessions: Vec<Vec<Step>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Everything the client sent across all sessions.
    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        self.written.clone()
    }
}

impl Dialer for ScriptDialer {
    type Stream = ScriptedStream;

    fn dial(&self) -> Result<ScriptedStream> {
        let steps = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProtocolError::Connection("no scripted session left".into()))?;
        Ok(ScriptedStream::from_steps(steps, self.written.clone()))
    }
}

/// Client output as text.
pub fn sent(written: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&written.lock().unwrap()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_plays_between_data() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut stream = ScriptedStream::from_steps(
            vec![
                Step::text("ab"),
                Step::Fail(io::ErrorKind::TimedOut),
                Step::text("cd"),
            ],
            written,
        );
        let mut buf = [0u8; 8];

        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"cd");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}
