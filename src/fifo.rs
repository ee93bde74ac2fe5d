//! Line-delimited command queue over a named pipe.
//!
//! The pipe is created at startup (mode 0666) and unlinked on drop. One
//! message is one client write of at most 4 KiB; the queue strips the
//! trailing newline and tokenizes on whitespace.

use std::collections::VecDeque;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::str::FromStr;

use crate::constants::MAX_MESSAGE_BYTES;
use crate::error::{CommandError, QueueError};

pub struct CommandQueue {
    path: String,
}

fn mkfifo(path: &str) {
    let cpath = CString::new(path).expect("fifo path contains NUL");
    unsafe {
        libc::unlink(cpath.as_ptr());
        libc::mkfifo(cpath.as_ptr(), 0o666);
    }
}

fn unlink(path: &str) {
    if let Ok(cpath) = CString::new(path) {
        unsafe {
            libc::unlink(cpath.as_ptr());
        }
    }
}

impl CommandQueue {
    pub fn new(path: &str) -> Result<Self, QueueError> {
        mkfifo(path);
        Ok(CommandQueue {
            path: path.to_string(),
        })
    }

    // Opening read-write keeps the pipe from signalling EOF whenever the
    // last client closes its end.
    fn open(&self) -> Result<File, QueueError> {
        let open = || OpenOptions::new().read(true).write(true).open(&self.path);
        match open() {
            Ok(f) => Ok(f),
            Err(_) => {
                mkfifo(&self.path);
                open().map_err(QueueError::Open)
            }
        }
    }

    /// Block until a non-empty message arrives.
    pub fn read_message(&mut self) -> Result<Message, QueueError> {
        loop {
            let mut file = self.open()?;
            let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
            let len = file.read(&mut buf).map_err(QueueError::Read)?;
            drop(file);
            if len == 0 {
                debug!("empty fifo read, retrying");
                continue;
            }
            let raw = String::from_utf8_lossy(&buf[..len])
                .trim_end_matches('\n')
                .to_string();
            return Ok(Message::from_line(&raw));
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        unlink(&self.path);
    }
}

/// One tokenized operator message.
pub struct Message {
    raw: String,
    tokens: VecDeque<String>,
}

impl Message {
    pub fn from_line(line: &str) -> Self {
        Message {
            raw: line.to_string(),
            tokens: line.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn has_tokens(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn pop_string(&mut self) -> Result<String, CommandError> {
        self.tokens.pop_front().ok_or(CommandError::OutOfTokens)
    }

    pub fn pop_number<T: FromStr>(&mut self) -> Result<T, CommandError> {
        let token = self.pop_string()?;
        token.parse().map_err(|_| CommandError::BadNumber(token))
    }
}
