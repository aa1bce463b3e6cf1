use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::protocol::{precision, Header, LeapIndicator, Mode, Timestamp, NTP_V4};
use crate::error::Error;

const RECV_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct Clock {
    offset: Duration,
    leap_time: Option<DateTime<Utc>>,
    leap_type: LeapIndicator,
}

/// An NTP server for tests. It can serve time at an offset from the real
/// clock and step across a single scheduled leap second.
///
/// The clock source is UTC, so serving during a real leap second gives
/// wrong answers.
pub struct NtpServer {
    socket: UdpSocket,
    clock: Mutex<Clock>,
}

impl NtpServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding NTP server to {}", addr))?;
        Ok(Self::with_socket(socket))
    }

    /// Wrap a socket bound elsewhere, e.g. on a namespace worker thread.
    pub fn from_std(socket: std::net::UdpSocket) -> Result<Self> {
        socket
            .set_nonblocking(true)
            .context("setting NTP socket non-blocking")?;
        let socket = UdpSocket::from_std(socket).context("registering NTP socket")?;
        Ok(Self::with_socket(socket))
    }

    fn with_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            clock: Mutex::new(Clock::default()),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("reading NTP server address")
    }

    fn clock(&self) -> std::sync::MutexGuard<'_, Clock> {
        // The clock holds plain values, so a poisoned lock is still usable.
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serve time as if the clock read `now` at this moment. `None` resets to real time.
    pub fn set_time(&self, now: Option<DateTime<Utc>>) {
        let mut clock = self.clock();
        clock.offset = match now {
            Some(t) => t - Utc::now(),
            None => Duration::zero(),
        };
    }

    /// Schedule a leap second.
    ///
    /// `second` must be exactly midnight UTC on the first day of a month,
    /// the first instant that is valid after both an added and a removed
    /// second, matching the official leap-seconds list.
    pub fn set_leap_second(
        &self,
        second: Option<DateTime<Utc>>,
        direction: LeapIndicator,
    ) -> Result<()> {
        match second {
            None if direction != LeapIndicator::None => {
                return Err(Error::InvalidLeapSecond(format!(
                    "{:?} requires a time",
                    direction
                ))
                .into());
            }
            Some(t)
                if t.num_seconds_from_midnight() != 0 || t.nanosecond() != 0 || t.day() != 1 =>
            {
                return Err(Error::InvalidLeapSecond(format!(
                    "{} is not midnight on the first of a month",
                    t
                ))
                .into());
            }
            _ => {}
        }
        let mut clock = self.clock();
        clock.leap_time = second;
        clock.leap_type = direction;
        Ok(())
    }

    /// Current offset from real time, applying a due leap second.
    ///
    /// `now` is real time, not server time.
    pub fn update_offset(&self, now: DateTime<Utc>) -> (Duration, LeapIndicator) {
        let mut clock = self.clock();

        let leap_time = match clock.leap_time {
            Some(t) if clock.leap_type != LeapIndicator::None => t,
            _ => return (clock.offset, LeapIndicator::None),
        };

        let now = now + clock.offset;
        if now + Duration::hours(24) < leap_time {
            return (clock.offset, LeapIndicator::None);
        }

        if clock.leap_type == LeapIndicator::Add && now >= leap_time {
            info!(leap = %leap_time, "inserting leap second");
            clock.offset -= Duration::seconds(1);
            clock.leap_time = None;
            clock.leap_type = LeapIndicator::None;
        } else if clock.leap_type == LeapIndicator::Sub
            && now >= leap_time - Duration::seconds(1)
        {
            info!(leap = %leap_time, "skipping leap second");
            clock.offset += Duration::seconds(1);
            clock.leap_time = None;
            clock.leap_type = LeapIndicator::None;
        }

        (clock.offset, clock.leap_type)
    }

    /// Build the reply for one request packet received at `received`.
    pub fn response(&self, packet: &[u8], received: DateTime<Utc>) -> Result<Header> {
        let req = Header::decode(packet)?;
        if req.version != NTP_V4 {
            bail!("invalid NTP version {}", req.version);
        }
        if req.mode != Mode::Client {
            bail!("invalid NTP mode {:?}", req.mode);
        }

        // The transmit time could in principle cross the leap differently
        // from the receive time; that case is not handled.
        let (offset, leap) = self.update_offset(received);
        let received = Timestamp::from_datetime(received + offset);
        let transmit = Timestamp::from_datetime(Utc::now() + offset);

        Ok(Header {
            leap_indicator: leap,
            version: NTP_V4,
            mode: Mode::Server,
            poll: 6,
            stratum: 7,
            precision: precision(),
            reference_timestamp: received,
            origin_timestamp: req.transmit_timestamp,
            receive_timestamp: received,
            transmit_timestamp: transmit,
            ..Default::default()
        })
    }

    async fn respond(&self, client: SocketAddr, received: DateTime<Utc>, packet: Vec<u8>) {
        if packet.len() == RECV_BUFFER {
            error!(client = %client, "ignoring oversized NTP packet");
            return;
        }
        let resp = match self.response(&packet, received) {
            Ok(resp) => resp,
            Err(e) => {
                error!(client = %client, error = %e, "rejecting NTP request");
                return;
            }
        };
        debug!(client = %client, "received NTP request");

        let pkt = match resp.encode() {
            Ok(pkt) => pkt,
            Err(e) => {
                error!(error = %e, "creating NTP packet failed");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&pkt, client).await {
            error!(client = %client, error = %e, "sending NTP packet failed");
        }
    }

    /// Serve requests until the socket fails. Each request is answered in its own task.
    pub async fn serve(self: Arc<Self>) {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "started NTP server");
        }
        loop {
            let mut buf = vec![0u8; RECV_BUFFER];
            let (n, client) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "NTP server failed");
                    return;
                }
            };
            let received = Utc::now();
            buf.truncate(n);
            let server = self.clone();
            tokio::spawn(async move { server.respond(client, received, buf).await });
        }
    }

    /// Run [`serve`](Self::serve) in the background. Abort the handle to stop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn local_server() -> NtpServer {
        NtpServer::bind("127.0.0.1:0").await.unwrap()
    }

    fn leap() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 7, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_set_time() {
        let s = local_server().await;
        let start = Utc.with_ymd_and_hms(2013, 12, 10, 19, 22, 35).unwrap();
        s.set_time(Some(start));
        let drift = Utc::now() + s.clock().offset - start;
        assert!(drift >= Duration::zero() && drift <= Duration::seconds(1));

        s.set_time(None);
        assert_eq!(s.clock().offset, Duration::zero());
    }

    #[tokio::test]
    async fn test_set_leap_second_validation() {
        let s = local_server().await;
        s.set_leap_second(Some(leap()), LeapIndicator::Add).unwrap();
        assert_eq!(s.clock().leap_time, Some(leap()));
        assert_eq!(s.clock().leap_type, LeapIndicator::Add);

        s.set_leap_second(None, LeapIndicator::None).unwrap();

        for bad in [
            s.set_leap_second(None, LeapIndicator::Sub),
            s.set_leap_second(
                Some(Utc.with_ymd_and_hms(2012, 7, 2, 0, 0, 0).unwrap()),
                LeapIndicator::Add,
            ),
            s.set_leap_second(
                Some(Utc.with_ymd_and_hms(2012, 7, 1, 0, 0, 1).unwrap()),
                LeapIndicator::Add,
            ),
        ] {
            let err = bad.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::InvalidLeapSecond(_))
            ));
        }
    }

    fn check_updates(direction: LeapIndicator, table: &[(Duration, Duration, LeapIndicator)]) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let s = rt.block_on(local_server());
        s.set_leap_second(Some(leap()), direction).unwrap();
        for (at, want_off, want_li) in table {
            let (off, li) = s.update_offset(leap() + *at);
            assert_eq!(
                (off, li),
                (*want_off, *want_li),
                "wrong update at leap{:+}ms",
                at.num_milliseconds()
            );
        }
    }

    #[test]
    fn test_update_offset_add() {
        let zero = Duration::zero();
        let minus = Duration::seconds(-1);
        use LeapIndicator::{Add, None};
        check_updates(
            Add,
            &[
                (Duration::hours(-48), zero, None),
                (Duration::hours(-25), zero, None),
                (Duration::hours(-24), zero, Add),
                (Duration::hours(-23), zero, Add),
                (Duration::hours(-1), zero, Add),
                (Duration::minutes(-1), zero, Add),
                (Duration::seconds(-1), zero, Add),
                (Duration::milliseconds(-1), zero, Add),
                (Duration::nanoseconds(-1), zero, Add),
                (zero, minus, None),
                (Duration::nanoseconds(1), minus, None),
                (Duration::seconds(1), minus, None),
                (Duration::hours(1), minus, None),
            ],
        );
    }

    #[test]
    fn test_update_offset_sub() {
        let zero = Duration::zero();
        let plus = Duration::seconds(1);
        use LeapIndicator::{None, Sub};
        check_updates(
            Sub,
            &[
                (Duration::hours(-48), zero, None),
                (Duration::hours(-25), zero, None),
                (Duration::hours(-24), zero, Sub),
                (Duration::hours(-1), zero, Sub),
                (Duration::seconds(-2), zero, Sub),
                (Duration::seconds(-1) - Duration::milliseconds(1), zero, Sub),
                (Duration::seconds(-1) - Duration::nanoseconds(1), zero, Sub),
                (Duration::seconds(-1), plus, None),
                (Duration::nanoseconds(1), plus, None),
                (Duration::seconds(1), plus, None),
                (Duration::hours(1), plus, None),
            ],
        );
    }

    #[tokio::test]
    async fn test_response_rejects_non_client() {
        let s = local_server().await;
        let req = Header {
            version: NTP_V4,
            mode: Mode::Server,
            ..Default::default()
        };
        assert!(s.response(&req.encode().unwrap(), Utc::now()).is_err());

        let req = Header {
            version: 3,
            mode: Mode::Client,
            ..Default::default()
        };
        assert!(s.response(&req.encode().unwrap(), Utc::now()).is_err());
    }

    #[tokio::test]
    async fn test_serve_answers_client() {
        let server = Arc::new(local_server().await);
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        server.set_time(Some(start));
        let addr = server.local_addr().unwrap();
        let task = server.clone().start();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let req = Header {
            version: NTP_V4,
            mode: Mode::Client,
            transmit_timestamp: Timestamp {
                seconds: 0xd90b4fca,
                fraction: 0x77ce2d4e,
            },
            ..Default::default()
        };
        client.send_to(&req.encode().unwrap(), addr).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let resp = Header::decode(&buf[..n]).unwrap();
        task.abort();

        assert_eq!(resp.mode, Mode::Server);
        assert_eq!(resp.version, NTP_V4);
        assert_eq!(resp.stratum, 7);
        assert_eq!(resp.poll, 6);
        assert_eq!(resp.precision, -20);
        assert_eq!(resp.origin_timestamp, req.transmit_timestamp);
        assert_eq!(resp.reference_timestamp, resp.receive_timestamp);

        let served = resp.transmit_timestamp.seconds as i64 - super::super::protocol::JAN_1970;
        assert!((served - start.timestamp()).abs() <= 2);
    }
}
