//! Packet arrival trace, one CSV line per packet

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::packet::DataPacket;
use crate::participant::ParticipantInfo;
use crate::session::DataListener;

/// Writes `wall_clock_ms,sequence_number,rtp_timestamp` for every packet it
/// sees, then passes the packet on
pub struct PacketTracer<W: Write + Send> {
    sink: Mutex<W>,
    downstream: Option<Arc<dyn DataListener>>,
}

impl PacketTracer<BufWriter<File>> {
    pub fn to_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        tracing::info!("Tracing packet arrivals to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> PacketTracer<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
            downstream: None,
        }
    }

    pub fn with_downstream(mut self, downstream: Arc<dyn DataListener>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    pub fn flush(&self) -> Result<()> {
        self.sink.lock().flush()?;
        Ok(())
    }
}

impl<W: Write + Send> DataListener for PacketTracer<W> {
    fn data_packet_received(&self, participant: &ParticipantInfo, packet: &DataPacket) {
        let line = format!(
            "{},{},{}\n",
            chrono::Utc::now().timestamp_millis(),
            packet.sequence_number(),
            packet.timestamp()
        );
        if let Err(e) = self.sink.lock().write_all(line.as_bytes()) {
            tracing::warn!("Failed to write packet trace: {}", e);
        }
        if let Some(downstream) = &self.downstream {
            downstream.data_packet_received(participant, packet);
        }
    }
}

impl<W: Write + Send> Drop for PacketTracer<W> {
    fn drop(&mut self) {
        let _ = self.sink.get_mut().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playout::testing::{packet, Sink};

    #[test]
    fn test_writes_one_line_per_packet() {
        let sink = Arc::new(Sink::default());
        let tracer = PacketTracer::new(Vec::new()).with_downstream(sink.clone());
        let before = chrono::Utc::now().timestamp_millis();

        tracer.data_packet_received(&ParticipantInfo::new(1), &packet(7, 10));
        tracer.data_packet_received(&ParticipantInfo::new(1), &packet(8, 20));
        assert_eq!(sink.sequences(), vec![7, 8]);

        let text = String::from_utf8(std::mem::take(&mut *tracer.sink.lock())).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let fields: Vec<&str> = lines[0].split(',').collect();
        assert!(fields[0].parse::<i64>().unwrap() >= before);
        assert_eq!(fields[1], "7");
        assert_eq!(fields[2], "900");
        assert!(lines[1].ends_with(",8,1800"));
    }

    #[test]
    fn test_trace_file() {
        let dir = std::env::temp_dir().join(format!("rtp-trace-{}", std::process::id()));
        let path = dir.join("arrivals.csv");
        {
            let tracer = PacketTracer::to_file(&path).unwrap();
            tracer.data_packet_received(&ParticipantInfo::new(1), &packet(1, 1));
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with(",1,90\n"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
