use crate::stream::decode::{Event, EventDetail};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info};

/// Default event sink: writes every event on the `event` log target until
/// all senders are gone. Returns the number of events written.
pub async fn log_events(mut recv: Receiver<Event>) -> u64 {
    let mut count = 0;
    while let Some(e) = recv.recv().await {
        let detail = describe(&e.detail);
        info!(target: "event", event_type = format!("{:?}", e.kind), ts = e.timestamp_ns, cpu = e.cpu, tgid = e.tgid, pid = e.pid, uid = e.uid, gid = e.gid, command = e.comm.as_str(), detail = detail.as_str());
        count += 1;
    }
    debug!("Event sink closed after {} event(s)", count);
    count
}

fn describe(detail: &EventDetail) -> String {
    match detail {
        EventDetail::Exec { filename } => filename.clone(),
        EventDetail::Exit { code } => format!("code={}", code),
        EventDetail::Open { path, flags } => format!("{} flags={:#o}", path, flags),
        EventDetail::Network { addr, protocol } => format!("{} proto={}", addr, protocol),
        EventDetail::Syscall { nr, ret } => format!("nr={} ret={}", nr, ret),
        EventDetail::SchedSwitch { prev_pid, next_pid } => {
            format!("{} -> {}", prev_pid, next_pid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::RawEventRecord;
    use crate::stream::decode::tests::open_record;
    use crate::stream::decode::{CaatDecoder, RecordDecoder};
    use tokio::sync::mpsc;

    #[test]
    fn describe_details() {
        assert_eq!(
            describe(&EventDetail::Open {
                path: "/etc/hosts".into(),
                flags: 0o2
            }),
            "/etc/hosts flags=0o2"
        );
        assert_eq!(
            describe(&EventDetail::Network {
                addr: "[::1]:8080".parse().unwrap(),
                protocol: 6
            }),
            "[::1]:8080 proto=6"
        );
    }

    #[tokio::test]
    async fn drains_until_closed() {
        let (snd, recv) = mpsc::channel(4);
        let task = tokio::spawn(log_events(recv));
        for ts in 1..=3 {
            let raw = RawEventRecord {
                cpu: Some(0),
                data: open_record(1, ts, "/a"),
            };
            snd.send(CaatDecoder.decode(&raw).unwrap()).await.unwrap();
        }
        drop(snd);
        assert_eq!(task.await.unwrap(), 3);
    }
}
