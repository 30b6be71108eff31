use core::fmt::Write as _;
use std::io::Read;

use log::debug;

use crate::{
    buffer::BoundedBuffer,
    codec::{self, ResponseReader},
    config::{ApiConfig, DeviceConfig},
    error::HttpError,
    transport::{Dialer, Session, Sleeper},
};

pub const TELEMETRY_BODY_CAPACITY: usize = 192;

// Only the framing of the reply matters; its body is read into this and dropped.
const REPLY_SINK_CAPACITY: usize = 64;

// Widest reading we budget for, e.g. `-12345678.123`.
const READING_WIDTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub temperature: f32,
    pub humidity: f32,
}

/// Upper bound of the encoded body for `device`, assuming readings fit
/// `READING_WIDTH` characters.
pub fn max_body_len(device: &DeviceConfig) -> usize {
    "temp=".len()
        + READING_WIDTH
        + "&humidity=".len()
        + READING_WIDTH
        + "&id=".len()
        + device.id.len()
        + "&token=".len()
        + device.token.len()
}

pub fn encode_body(
    sample: &TelemetrySample,
    device: &DeviceConfig,
) -> Result<heapless::String<TELEMETRY_BODY_CAPACITY>, HttpError> {
    let mut body = heapless::String::new();
    write!(
        body,
        "temp={:.3}&humidity={:.3}&id={}&token={}",
        sample.temperature, sample.humidity, device.id, device.token
    )
    .map_err(|_| HttpError::RequestTooLarge {
        capacity: TELEMETRY_BODY_CAPACITY,
    })?;
    Ok(body)
}

pub struct TelemetryReporter {
    host: String,
    path: String,
    device: DeviceConfig,
}

impl TelemetryReporter {
    pub fn new(api: &ApiConfig, device: &DeviceConfig) -> Self {
        Self {
            host: api.host.clone(),
            path: api.path("data"),
            device: device.clone(),
        }
    }

    /// Posts one sample and consumes the reply so the connection can carry the
    /// next request. Fails on a send error or a non-200 reply; a reply that
    /// cannot be read to its end only leaves the session dirty.
    pub fn report<D: Dialer, S: Sleeper>(
        &self,
        session: &mut Session<D, S>,
        sample: &TelemetrySample,
    ) -> Result<(), HttpError> {
        let body = encode_body(sample, &self.device)?;
        let reply = session.exchange(|conn| {
            codec::write_form_post(conn, &self.host, &self.path, body.as_bytes())?;
            Ok(consume_reply(conn))
        })?;

        match reply {
            Ok(()) => Ok(()),
            Err(Reply::Rejected(err)) => Err(err),
            Err(Reply::Unread(err)) => {
                debug!("telemetry reply not consumed: {err}");
                session.mark_dirty();
                Ok(())
            }
        }
    }
}

enum Reply {
    /// Fully read, but not a 200.
    Rejected(HttpError),
    /// Reading stopped partway.
    Unread(HttpError),
}

fn consume_reply<R: Read + ?Sized>(conn: &mut R) -> Result<(), Reply> {
    let mut reader = ResponseReader::new(conn);
    let status = match reader.expect_status_ok() {
        Ok(()) => Ok(()),
        Err(err @ HttpError::UnexpectedStatus(_)) => Err(Reply::Rejected(err)),
        Err(err) => return Err(Reply::Unread(err)),
    };

    let framing = reader.read_headers().map_err(Reply::Unread)?;
    let mut sink = BoundedBuffer::<REPLY_SINK_CAPACITY>::new();
    match reader.read_body(framing, &mut sink) {
        Ok(()) | Err(HttpError::BodyOverflow { .. }) => status,
        Err(err) => Err(Reply::Unread(err)),
    }
}

#[cfg(test)]
mod tests {
    use std::{io::ErrorKind, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        testing::{FakeDialer, RecordingSleeper, Step},
        transport::RetryPolicy,
        FailureClass,
    };

    fn session(dialer: FakeDialer) -> Session<FakeDialer, RecordingSleeper> {
        Session::new(
            dialer,
            RecordingSleeper::default(),
            RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
            "api.test:80",
        )
    }

    fn sample() -> TelemetrySample {
        TelemetrySample {
            temperature: 19.0,
            humidity: 55.5,
        }
    }

    fn device() -> DeviceConfig {
        DeviceConfig {
            id: "bed-7".to_string(),
            token: "s3cret".to_string(),
        }
    }

    fn reporter() -> TelemetryReporter {
        let api = ApiConfig {
            host: "api.test".to_string(),
            ..ApiConfig::default()
        };
        TelemetryReporter::new(&api, &device())
    }

    #[test]
    fn encodes_readings_with_three_decimals() {
        let body = encode_body(
            &TelemetrySample {
                temperature: 21.5,
                humidity: 40.25,
            },
            &device(),
        )
        .unwrap();

        assert_eq!(body.as_str(), "temp=21.500&humidity=40.250&id=bed-7&token=s3cret");
        assert!(body.len() <= max_body_len(&device()));
    }

    #[test]
    fn absurd_reading_fails_before_anything_is_sent() {
        let dialer = FakeDialer::always_connect();
        let mut session = session(dialer.clone());
        let sample = TelemetrySample {
            temperature: f32::MAX,
            humidity: f32::MAX,
        };

        let api = ApiConfig {
            host: "api.test".to_string(),
            ..ApiConfig::default()
        };
        let device = DeviceConfig {
            id: "bed-7".to_string(),
            token: "t".repeat(100),
        };

        let err = TelemetryReporter::new(&api, &device)
            .report(&mut session, &sample)
            .unwrap_err();

        assert!(matches!(err, HttpError::RequestTooLarge { .. }));
        assert_eq!(dialer.dial_count(), 0);
        assert_eq!(dialer.written(), "");
    }

    #[test]
    fn posts_form_body_and_consumes_the_reply() {
        let dialer = FakeDialer::with_scripts(vec![vec![
            Step::data(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
            Step::data(b"NEXT"),
        ]]);
        let mut session = session(dialer.clone());

        reporter().report(&mut session, &sample()).unwrap();

        let written = dialer.written();
        assert!(written.starts_with("POST /wexteras/data HTTP/1.1\r\nHost: api.test\r\n"));
        assert!(written.contains("Content-Length: 49\r\n"));
        assert!(written.ends_with("\r\n\r\ntemp=19.000&humidity=55.500&id=bed-7&token=s3cret\r\n"));

        // Nothing past the reply was touched.
        let next = session
            .exchange(|conn| {
                let mut rest = [0_u8; 4];
                conn.read_exact(&mut rest)?;
                Ok(rest)
            })
            .unwrap();
        assert_eq!(&next, b"NEXT");
    }

    #[test]
    fn repeated_posts_reuse_an_undrainable_connection() {
        let reply: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
        let dialer = FakeDialer::with_scripts(vec![vec![Step::data(reply); 3]]).undrainable();
        let mut session = session(dialer.clone());

        for _ in 0..3 {
            reporter().report(&mut session, &sample()).unwrap();
        }

        assert_eq!(dialer.dial_count(), 1);
        assert!(session.is_connected());
    }

    #[test]
    fn oversized_reply_body_is_drained_not_fatal() {
        let mut reply = b"HTTP/1.1 200 OK\r\nContent-Length: 300\r\n\r\n".to_vec();
        reply.extend(std::iter::repeat(b'z').take(300));
        let dialer = FakeDialer::with_scripts(vec![vec![Step::Data(reply)]]).undrainable();
        let mut session = session(dialer.clone());

        reporter().report(&mut session, &sample()).unwrap();
        reporter().report(&mut session, &sample()).unwrap();

        // The second reply never arrives, so that connection is now dirty.
        assert_eq!(dialer.dial_count(), 1);
        session.exchange(|_| Ok(())).unwrap();
        assert_eq!(dialer.dial_count(), 2);
    }

    #[test]
    fn rejected_post_keeps_the_connection() {
        let dialer = FakeDialer::with_scripts(vec![vec![Step::data(
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\ndenied",
        )]])
        .undrainable();
        let mut session = session(dialer.clone());

        let err = reporter().report(&mut session, &sample()).unwrap_err();

        assert_eq!(err.class(), FailureClass::Protocol);
        assert!(session.is_connected());
        session.exchange(|_| Ok(())).unwrap();
        assert_eq!(dialer.dial_count(), 1);
    }

    #[test]
    fn send_failure_tears_down() {
        let dialer = FakeDialer::always_connect().failing_writes(ErrorKind::BrokenPipe);
        let mut session = session(dialer);

        let err = reporter().report(&mut session, &sample()).unwrap_err();

        assert!(matches!(err, HttpError::Io(_)));
        assert!(!session.is_connected());
    }
}
