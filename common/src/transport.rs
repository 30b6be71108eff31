use std::{
    io::{self, Read, Write},
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{config::ApiConfig, error::HttpError};

/// A connected byte stream to the API host.
pub trait Connection: Read + Write {
    /// Throws away bytes that arrived but were never read. Transports that
    /// cannot tell what is pending return an error and get redialed.
    fn discard_pending(&mut self) -> io::Result<usize>;
}

pub trait Dialer {
    type Conn: Connection;

    fn dial(&mut self) -> io::Result<Self::Conn>;
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_api(api: &ApiConfig) -> Self {
        Self {
            attempts: api.retries,
            delay: Duration::from_millis(api.retry_delay_ms),
        }
    }

    /// Calls `op` until it succeeds or the attempt budget is spent, sleeping
    /// `delay` between failed attempts.
    pub fn run<T, E, S>(
        &self,
        sleeper: &mut S,
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, Exhausted<E>>
    where
        S: Sleeper + ?Sized,
    {
        let budget = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(last) if attempt >= budget => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last,
                    })
                }
                Err(_) => {
                    sleeper.sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// One reusable connection to the API host, dialed on demand.
pub struct Session<D: Dialer, S: Sleeper> {
    dialer: D,
    sleeper: S,
    policy: RetryPolicy,
    endpoint: String,
    conn: Option<D::Conn>,
    dirty: bool,
}

impl<D: Dialer, S: Sleeper> Session<D, S> {
    pub fn new(dialer: D, sleeper: S, policy: RetryPolicy, endpoint: impl Into<String>) -> Self {
        Self {
            dialer,
            sleeper,
            policy,
            endpoint: endpoint.into(),
            conn: None,
            dirty: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn ensure_connected(&mut self) -> Result<&mut D::Conn, HttpError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.dial()?,
        };
        Ok(self.conn.insert(conn))
    }

    pub fn teardown(&mut self) {
        if self.conn.take().is_some() {
            debug!("closed connection to {}", self.endpoint);
        }
        self.dirty = false;
    }

    /// Records that the last response on this connection was left unread.
    pub fn mark_dirty(&mut self) {
        if self.conn.is_some() {
            self.dirty = true;
        }
    }

    /// Runs one request/response exchange. Any failure tears the connection
    /// down so the next exchange starts from a fresh dial.
    pub fn exchange<T>(
        &mut self,
        op: impl FnOnce(&mut D::Conn) -> Result<T, HttpError>,
    ) -> Result<T, HttpError> {
        self.recover_framing();
        let conn = self.ensure_connected()?;

        match op(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.teardown();
                Err(err)
            }
        }
    }

    fn recover_framing(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        match conn.discard_pending() {
            Ok(0) => {}
            Ok(count) => debug!("discarded {count} stale byte(s) from {}", self.endpoint),
            Err(err) => {
                debug!("cannot drain {} ({err}); redialing", self.endpoint);
                self.teardown();
            }
        }
    }

    fn dial(&mut self) -> Result<D::Conn, HttpError> {
        let policy = self.policy;
        let dialer = &mut self.dialer;
        let endpoint = &self.endpoint;

        let result = policy.run(&mut self.sleeper, |attempt| {
            dialer.dial().inspect_err(|err| {
                debug!("dial attempt {attempt}/{} to {endpoint} failed: {err}", policy.attempts);
            })
        });

        match result {
            Ok(conn) => {
                info!("connected to {}", self.endpoint);
                Ok(conn)
            }
            Err(Exhausted { attempts, last }) => {
                warn!("giving up on {} after {attempts} attempt(s)", self.endpoint);
                Err(HttpError::Connect {
                    endpoint: self.endpoint.clone(),
                    attempts,
                    source: last,
                })
            }
        }
    }
}
