//! In-memory transport doubles for unit tests.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    rc::Rc,
    time::Duration,
};

use crate::transport::{Connection, Dialer, Sleeper};

#[derive(Debug, Clone)]
pub enum Step {
    Data(Vec<u8>),
    Error(ErrorKind),
    Eof,
}

impl Step {
    pub fn data(bytes: &[u8]) -> Self {
        Self::Data(bytes.to_vec())
    }
}

/// Replays scripted reads; once the script runs out every read times out.
#[derive(Debug)]
pub struct ScriptedConnection {
    steps: VecDeque<Step>,
    written: Rc<RefCell<Vec<u8>>>,
    drainable: bool,
    write_error: Option<ErrorKind>,
}

impl Read for ScriptedConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            None => Err(ErrorKind::TimedOut.into()),
            Some(Step::Eof) => Ok(0),
            Some(Step::Error(kind)) => Err(kind.into()),
            Some(Step::Data(mut data)) => {
                let count = buf.len().min(data.len());
                buf[..count].copy_from_slice(&data[..count]);
                if count < data.len() {
                    self.steps.push_front(Step::Data(data.split_off(count)));
                }
                Ok(count)
            }
        }
    }
}

impl Write for ScriptedConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.write_error {
            return Err(kind.into());
        }
        self.written.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for ScriptedConnection {
    fn discard_pending(&mut self) -> io::Result<usize> {
        if !self.drainable {
            return Err(ErrorKind::Unsupported.into());
        }
        let mut discarded = 0;
        while let Some(Step::Data(data)) = self.steps.front() {
            discarded += data.len();
            self.steps.pop_front();
        }
        Ok(discarded)
    }
}

#[derive(Default)]
struct DialerState {
    dials: u32,
    failures_left: u32,
    scripts: VecDeque<Vec<Step>>,
    written: Rc<RefCell<Vec<u8>>>,
    undrainable: bool,
    write_error: Option<ErrorKind>,
}

#[derive(Clone, Default)]
pub struct FakeDialer {
    state: Rc<RefCell<DialerState>>,
}

impl FakeDialer {
    pub fn always_connect() -> Self {
        Self::default()
    }

    pub fn fail_first(failures: u32) -> Self {
        let dialer = Self::default();
        dialer.state.borrow_mut().failures_left = failures;
        dialer
    }

    /// One script per successful dial, in order.
    pub fn with_scripts(scripts: Vec<Vec<Step>>) -> Self {
        let dialer = Self::default();
        dialer.state.borrow_mut().scripts = scripts.into();
        dialer
    }

    pub fn undrainable(self) -> Self {
        self.state.borrow_mut().undrainable = true;
        self
    }

    pub fn failing_writes(self, kind: ErrorKind) -> Self {
        self.state.borrow_mut().write_error = Some(kind);
        self
    }

    pub fn dial_count(&self) -> u32 {
        self.state.borrow().dials
    }

    pub fn written(&self) -> String {
        let state = self.state.borrow();
        let written = state.written.borrow();
        String::from_utf8_lossy(&written).into_owned()
    }
}

impl Dialer for FakeDialer {
    type Conn = ScriptedConnection;

    fn dial(&mut self) -> io::Result<Self::Conn> {
        let mut state = self.state.borrow_mut();
        state.dials += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(ErrorKind::ConnectionRefused.into());
        }

        Ok(ScriptedConnection {
            steps: state.scripts.pop_front().unwrap_or_default().into(),
            written: state.written.clone(),
            drainable: !state.undrainable,
            write_error: state.write_error,
        })
    }
}

#[derive(Clone, Default)]
pub struct RecordingSleeper {
    slept: Rc<RefCell<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}
