use crate::Schedule;
use std::collections::BTreeSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tocsin_common::collect::{tags, Collect};

/// Round-trip budget for one reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Background worker: every probe interval, every host seen in the state
/// store's `host` tags gets a reachability check on its own thread.
pub(crate) fn ping_hosts(sched: Arc<Schedule>) {
    let interval = Duration::from_secs(sched.config().ping_interval_secs.max(1));
    let port = sched.config().probe_port;
    while !sched.stopped() {
        let hosts: BTreeSet<String> = {
            let guard = sched.lock("PingHosts");
            guard
                .status
                .values()
                .filter_map(|st| st.group.get("host").cloned())
                .collect()
        };
        for host in hosts {
            let collect = Arc::clone(sched.collect());
            std::thread::spawn(move || probe_host(&host, port, &collect));
        }
        std::thread::sleep(interval);
    }
}

/// Resolves and connects to `host:port`, reporting resolution, round-trip
/// time, and timeout gauges tagged with the destination host.
fn probe_host(host: &str, port: u16, collect: &Collect) {
    let t = tags([("dst_host", host)]);
    let addr = match (host, port).to_socket_addrs().ok().and_then(|mut a| a.next()) {
        Some(addr) => {
            collect.put("ping.resolved", t.clone(), 1.0);
            addr
        }
        None => {
            collect.put("ping.resolved", t, 0.0);
            return;
        }
    };
    let start = Instant::now();
    match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(_) => {
            let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;
            collect.put("ping.rtt", t.clone(), rtt_ms);
            collect.put("ping.timeout", t, 0.0);
        }
        Err(_) => {
            collect.put("ping.timeout", t, 1.0);
        }
    }
}
