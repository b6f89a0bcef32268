use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Idle upstream connections for one group. A connection leaves the pool
/// while a request uses it and is returned (or dropped) at finalize, so at
/// most one request is ever in flight per connection.
pub struct KeepalivePool {
    capacity: usize,
    max_idle: Duration,
    idle: Mutex<VecDeque<IdleConn>>,
}

struct IdleConn {
    addr: SocketAddr,
    stream: TcpStream,
    since: Instant,
}

impl KeepalivePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            max_idle: Duration::from_secs(60),
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Take an idle connection to `addr`, discarding expired entries.
    pub fn get(&self, addr: SocketAddr) -> Option<TcpStream> {
        if self.capacity == 0 {
            return None;
        }
        let mut idle = self.idle.lock().unwrap();
        let now = Instant::now();
        idle.retain(|c| now.duration_since(c.since) < self.max_idle);
        let pos = idle.iter().position(|c| c.addr == addr)?;
        idle.remove(pos).map(|c| c.stream)
    }

    /// Return a connection; the oldest entry is dropped at capacity.
    pub fn put(&self, addr: SocketAddr, stream: TcpStream) {
        if self.capacity == 0 {
            return;
        }
        let mut idle = self.idle.lock().unwrap();
        while idle.len() >= self.capacity {
            idle.pop_front();
        }
        idle.push_back(IdleConn {
            addr,
            stream,
            since: Instant::now(),
        });
    }

    #[cfg(test)]
    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(listener: &TcpListener) -> TcpStream {
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        client.unwrap()
    }

    #[tokio::test]
    async fn round_trips_a_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let pool = KeepalivePool::new(2);

        assert!(pool.get(addr).is_none());
        pool.put(addr, pair(&listener).await);
        assert!(pool.get(addr).is_some());
        assert!(pool.get(addr).is_none());
    }

    #[tokio::test]
    async fn capacity_drops_oldest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let c: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        let pool = KeepalivePool::new(2);

        pool.put(a, pair(&listener).await);
        pool.put(b, pair(&listener).await);
        pool.put(c, pair(&listener).await);
        assert_eq!(pool.idle_len(), 2);
        assert!(pool.get(a).is_none(), "oldest entry should have been dropped");
        assert!(pool.get(b).is_some());
        assert!(pool.get(c).is_some());
    }

    #[tokio::test]
    async fn zero_capacity_disables_pooling() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let pool = KeepalivePool::new(0);
        pool.put(addr, pair(&listener).await);
        assert!(pool.get(addr).is_none());
    }
}
