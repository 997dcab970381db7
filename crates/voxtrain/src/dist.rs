//! Process-group coordination over local TCP.
//!
//! One worker process per device joins a group anchored at a fixed
//! address/port: rank 0 binds the listener and every other rank connects to
//! it, giving a star topology. Collectives route through rank 0: scalars and
//! gradient buffers travel to rank 0, get combined, and flow back out. All
//! collectives block until every rank reaches the same call; a crashed peer
//! leaves the others waiting at the next synchronization point.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use crate::error::{TrainError, TrainResult};

const MSG_JOIN: u32 = 1;
const MSG_JOIN_ACK: u32 = 2;
const MSG_REDUCE: u32 = 3;
const MSG_ALL_REDUCE: u32 = 4;
const MSG_BARRIER: u32 = 5;
const MSG_RESULT: u32 = 6;

/// Options for group formation.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Address the rendezvous listener binds to.
    pub addr: String,
    /// Port the rendezvous listener binds to.
    pub port: u16,
    /// Bound on how long `join` waits for the full group to form.
    pub join_timeout: Duration,
    /// Read timeout on established connections; `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
}

impl GroupOptions {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            join_timeout: Duration::from_secs(60),
            io_timeout: None,
        }
    }
}

/// Handle to a joined communication group.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    /// On rank 0: one stream per peer, index `peer_rank - 1`.
    /// On other ranks: a single stream to rank 0.
    streams: Vec<TcpStream>,
    closed: bool,
}

fn send_msg(stream: &mut TcpStream, msg_type: u32, data: &[f64]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(12 + data.len() * 8);
    frame.extend_from_slice(&msg_type.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for v in data {
        frame.extend_from_slice(&v.to_le_bytes());
    }
    stream.write_all(&frame)?;
    stream.flush()
}

fn recv_msg(stream: &mut TcpStream) -> std::io::Result<(u32, Vec<f64>)> {
    let mut header = [0u8; 12];
    stream.read_exact(&mut header)?;
    let msg_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u64::from_le_bytes(header[4..12].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len * 8];
    stream.read_exact(&mut payload)?;
    let data = payload
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok((msg_type, data))
}

fn expect_msg(
    stream: &mut TcpStream,
    expected: u32,
    peer: usize,
) -> TrainResult<Vec<f64>> {
    let (msg_type, data) = recv_msg(stream).map_err(|e| TrainError::Collective {
        peer,
        message: e.to_string(),
    })?;
    if msg_type != expected {
        return Err(TrainError::Collective {
            peer,
            message: format!("expected message type {}, got {}", expected, msg_type),
        });
    }
    Ok(data)
}

impl ProcessGroup {
    /// Join the communication group, blocking until all `world_size` workers
    /// have joined or the bounded wait elapses.
    pub fn join(rank: usize, world_size: usize, opts: &GroupOptions) -> TrainResult<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TrainError::GroupJoin {
                rank,
                world_size,
                message: "rank must be < world_size".into(),
            });
        }
        if world_size == 1 {
            return Ok(Self {
                rank,
                world_size,
                streams: Vec::new(),
                closed: false,
            });
        }

        let join_err = |message: String| TrainError::GroupJoin {
            rank,
            world_size,
            message,
        };
        let deadline = Instant::now() + opts.join_timeout;
        let endpoint = format!("{}:{}", opts.addr, opts.port);

        if rank == 0 {
            let listener = TcpListener::bind(&endpoint)
                .map_err(|e| join_err(format!("bind {}: {}", endpoint, e)))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| join_err(e.to_string()))?;

            let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
            let mut joined = 0;
            while joined < world_size - 1 {
                if Instant::now() >= deadline {
                    return Err(join_err(format!(
                        "timed out with {}/{} workers joined",
                        joined + 1,
                        world_size
                    )));
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream
                            .set_nonblocking(false)
                            .map_err(|e| join_err(e.to_string()))?;
                        stream.set_nodelay(true).ok();
                        // The join handshake itself stays under the deadline.
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        stream
                            .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                            .ok();
                        let data = expect_msg(&mut stream, MSG_JOIN, usize::MAX)
                            .map_err(|e| join_err(e.to_string()))?;
                        stream.set_read_timeout(opts.io_timeout).ok();
                        let peer = data.first().copied().unwrap_or(-1.0) as i64;
                        if peer < 1 || peer as usize >= world_size {
                            return Err(join_err(format!("invalid peer rank {}", peer)));
                        }
                        let slot = &mut slots[peer as usize - 1];
                        if slot.is_some() {
                            return Err(join_err(format!("rank {} joined twice", peer)));
                        }
                        *slot = Some(stream);
                        joined += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => return Err(join_err(format!("accept: {}", e))),
                }
            }

            let mut streams = Vec::with_capacity(world_size - 1);
            for slot in slots {
                streams.push(slot.expect("all slots filled"));
            }
            for stream in &mut streams {
                send_msg(stream, MSG_JOIN_ACK, &[])
                    .map_err(|e| join_err(format!("ack: {}", e)))?;
            }
            Ok(Self {
                rank,
                world_size,
                streams,
                closed: false,
            })
        } else {
            let mut stream = loop {
                match TcpStream::connect(&endpoint) {
                    Ok(s) => break s,
                    Err(e) => {
                        if Instant::now() >= deadline {
                            return Err(join_err(format!("connect {}: {}", endpoint, e)));
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            };
            stream.set_nodelay(true).ok();
            stream
                .set_read_timeout(Some(opts.join_timeout))
                .map_err(|e| join_err(e.to_string()))?;
            send_msg(&mut stream, MSG_JOIN, &[rank as f64])
                .map_err(|e| join_err(format!("join send: {}", e)))?;
            expect_msg(&mut stream, MSG_JOIN_ACK, 0).map_err(|e| join_err(e.to_string()))?;
            stream.set_read_timeout(opts.io_timeout).ok();
            Ok(Self {
                rank,
                world_size,
                streams: vec![stream],
                closed: false,
            })
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Sum a scalar across all workers. The total is delivered only to
    /// `dst`; every other rank gets its own contribution back and must not
    /// interpret it.
    pub fn reduce(&mut self, value: f64, dst: usize) -> TrainResult<f64> {
        if self.world_size == 1 {
            return Ok(value);
        }
        if self.rank == 0 {
            let mut total = value;
            for (i, stream) in self.streams.iter_mut().enumerate() {
                let data = expect_msg(stream, MSG_REDUCE, i + 1)?;
                total += data.first().copied().unwrap_or(0.0);
            }
            if dst == 0 {
                Ok(total)
            } else {
                let stream = &mut self.streams[dst - 1];
                send_msg(stream, MSG_RESULT, &[total]).map_err(|e| TrainError::Collective {
                    peer: dst,
                    message: e.to_string(),
                })?;
                Ok(value)
            }
        } else {
            let stream = &mut self.streams[0];
            send_msg(stream, MSG_REDUCE, &[value]).map_err(|e| TrainError::Collective {
                peer: 0,
                message: e.to_string(),
            })?;
            if self.rank == dst {
                let data = expect_msg(stream, MSG_RESULT, 0)?;
                Ok(data.first().copied().unwrap_or(f64::NAN))
            } else {
                Ok(value)
            }
        }
    }

    /// Element-wise sum across all workers; the result is visible on every
    /// rank. Buffers must have identical length on all ranks.
    pub fn all_reduce(&mut self, buf: &mut [f64]) -> TrainResult<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for (i, stream) in self.streams.iter_mut().enumerate() {
                let data = expect_msg(stream, MSG_ALL_REDUCE, i + 1)?;
                if data.len() != buf.len() {
                    return Err(TrainError::Collective {
                        peer: i + 1,
                        message: format!(
                            "all_reduce length mismatch: {} vs {}",
                            data.len(),
                            buf.len()
                        ),
                    });
                }
                for (acc, v) in buf.iter_mut().zip(data.iter()) {
                    *acc += v;
                }
            }
            for (i, stream) in self.streams.iter_mut().enumerate() {
                send_msg(stream, MSG_RESULT, buf).map_err(|e| TrainError::Collective {
                    peer: i + 1,
                    message: e.to_string(),
                })?;
            }
            Ok(())
        } else {
            let stream = &mut self.streams[0];
            send_msg(stream, MSG_ALL_REDUCE, buf).map_err(|e| TrainError::Collective {
                peer: 0,
                message: e.to_string(),
            })?;
            let data = expect_msg(stream, MSG_RESULT, 0)?;
            buf.copy_from_slice(&data);
            Ok(())
        }
    }

    /// Block until every worker has called `barrier` at the same point.
    pub fn barrier(&mut self) -> TrainResult<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for (i, stream) in self.streams.iter_mut().enumerate() {
                expect_msg(stream, MSG_BARRIER, i + 1)?;
            }
            for (i, stream) in self.streams.iter_mut().enumerate() {
                send_msg(stream, MSG_BARRIER, &[]).map_err(|e| TrainError::Collective {
                    peer: i + 1,
                    message: e.to_string(),
                })?;
            }
        } else {
            let stream = &mut self.streams[0];
            send_msg(stream, MSG_BARRIER, &[]).map_err(|e| TrainError::Collective {
                peer: 0,
                message: e.to_string(),
            })?;
            expect_msg(stream, MSG_BARRIER, 0)?;
        }
        Ok(())
    }

    /// Release group resources. Safe to call more than once; `Drop` also
    /// runs it, so the failure path tears down too.
    pub fn leave(&mut self) {
        if self.closed {
            return;
        }
        for stream in &self.streams {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
        self.streams.clear();
        self.closed = true;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(port: u16) -> GroupOptions {
        let mut o = GroupOptions::new("127.0.0.1", port);
        o.join_timeout = Duration::from_secs(10);
        o
    }

    fn run_workers<F>(world_size: usize, port: u16, f: F)
    where
        F: Fn(ProcessGroup) + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let f = f.clone();
                std::thread::spawn(move || {
                    let group = ProcessGroup::join(rank, world_size, &opts(port)).unwrap();
                    f(group);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_single_worker_short_circuits() {
        let mut group = ProcessGroup::join(0, 1, &opts(29600)).unwrap();
        assert_eq!(group.reduce(3.5, 0).unwrap(), 3.5);
        let mut buf = [1.0, 2.0];
        group.all_reduce(&mut buf).unwrap();
        assert_eq!(buf, [1.0, 2.0]);
        group.barrier().unwrap();
        group.leave();
        group.leave(); // idempotent
    }

    #[test]
    fn test_reduce_delivers_total_to_destination() {
        run_workers(2, 29601, |mut group| {
            let rank = group.rank();
            let value = (rank + 1) as f64; // 1.0 and 2.0
            let total = group.reduce(value, 0).unwrap();
            if rank == 0 {
                assert_eq!(total, 3.0);
            }
            group.leave();
        });
    }

    #[test]
    fn test_reduce_to_nonzero_destination() {
        run_workers(3, 29602, |mut group| {
            let rank = group.rank();
            let total = group.reduce(1.0, 2).unwrap();
            if rank == 2 {
                assert_eq!(total, 3.0);
            }
            group.leave();
        });
    }

    #[test]
    fn test_all_reduce_sums_everywhere() {
        run_workers(2, 29603, |mut group| {
            let rank = group.rank();
            let mut buf = vec![rank as f64 + 1.0, 10.0 * (rank as f64 + 1.0)];
            group.all_reduce(&mut buf).unwrap();
            assert_eq!(buf, vec![3.0, 30.0]);
            group.leave();
        });
    }

    #[test]
    fn test_barrier_and_repeated_collectives() {
        run_workers(2, 29604, |mut group| {
            for round in 0..3 {
                let total = group.reduce(round as f64, 0).unwrap();
                if group.rank() == 0 {
                    assert_eq!(total, 2.0 * round as f64);
                }
                group.barrier().unwrap();
            }
            group.leave();
        });
    }

    #[test]
    fn test_join_times_out_without_peers() {
        let mut o = opts(29605);
        o.join_timeout = Duration::from_millis(200);
        let err = ProcessGroup::join(0, 2, &o).unwrap_err();
        match err {
            TrainError::GroupJoin { rank, world_size, .. } => {
                assert_eq!(rank, 0);
                assert_eq!(world_size, 2);
            }
            other => panic!("expected GroupJoin, got {}", other),
        }
    }

    #[test]
    fn test_invalid_rank_rejected() {
        let err = ProcessGroup::join(2, 2, &opts(29606)).unwrap_err();
        assert!(matches!(err, TrainError::GroupJoin { .. }));
    }
}
