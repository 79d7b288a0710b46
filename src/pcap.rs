use std::{
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use tokio::{fs::File, io::AsyncWriteExt as _, sync::mpsc};

const SNAPSHOT_LENGTH: usize = 2048;
const RECORD_HEADER_LENGTH: usize = 16;
const QUEUE_LIMIT: usize = 100;
// Raw IPv4/IPv6 packets without link-layer headers.
const LINKTYPE_RAW: u16 = 101;

type PcapRecord = (Box<[u8; RECORD_HEADER_LENGTH + SNAPSHOT_LENGTH]>, usize);

/// Background writer for tunnel traffic captures.
/// Finishes once every sender created by `create_sender` has been dropped.
pub struct PcapWriter {
    file: File,
    tx: mpsc::Sender<PcapRecord>,
    rx: mpsc::Receiver<PcapRecord>,
}

impl PcapWriter {
    pub async fn new(path: &str) -> Result<PcapWriter, io::Error> {
        let mut file = File::create(path).await?;

        // Nanosecond-resolution PCAP file header.
        file.write_u32(0xA1B23C4D).await?;
        file.write_u16(2).await?;
        file.write_u16(4).await?;
        file.write_u32(0).await?;
        file.write_u32(0).await?;
        file.write_u32(SNAPSHOT_LENGTH as u32).await?;
        file.write_u16(0).await?;
        file.write_u16(LINKTYPE_RAW).await?;
        debug!("Capturing tunnel traffic to {path}");

        let (tx, rx) = mpsc::channel(QUEUE_LIMIT);
        Ok(PcapWriter { file, tx, rx })
    }

    pub fn create_sender(&self) -> PcapSender {
        PcapSender {
            tx: self.tx.clone(),
            data_lost: false,
        }
    }

    pub async fn run(self) {
        let PcapWriter {
            mut file,
            tx,
            mut rx,
        } = self;
        drop(tx);
        while let Some((record, length)) = rx.recv().await {
            if let Err(err) = file.write_all(&record[..length]).await {
                log::error!("Failed to write packet to PCAP file: {err}");
            }
        }
        if let Err(err) = file.flush().await {
            log::error!("Failed to flush PCAP file: {err}");
        }
    }
}

pub struct PcapSender {
    tx: mpsc::Sender<PcapRecord>,
    data_lost: bool,
}

impl PcapSender {
    pub fn send_packet(&mut self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }
        let time = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(time) => time,
            Err(err) => {
                warn!("Failed to convert time into UNIX for PCAP: {err}");
                return;
            }
        };
        let mut record = Box::new([0u8; RECORD_HEADER_LENGTH + SNAPSHOT_LENGTH]);
        let captured_length =
            Self::write_record(&mut record[..], time.as_secs(), time.subsec_nanos(), packet);

        if let Err(err) = self.tx.try_send((record, captured_length)) {
            if !self.data_lost {
                self.data_lost = true;
                log::error!("PCAP send buffer is full, some data will be lost: {err}");
            }
        }
    }

    fn write_record(dest: &mut [u8], secs: u64, nanos: u32, packet: &[u8]) -> usize {
        let captured_length = packet.len().min(SNAPSHOT_LENGTH);
        dest[0..4].copy_from_slice(&(secs as u32).to_be_bytes());
        dest[4..8].copy_from_slice(&nanos.to_be_bytes());
        dest[8..12].copy_from_slice(&(captured_length as u32).to_be_bytes());
        dest[12..16].copy_from_slice(&(packet.len() as u32).to_be_bytes());
        dest[RECORD_HEADER_LENGTH..RECORD_HEADER_LENGTH + captured_length]
            .copy_from_slice(&packet[..captured_length]);
        RECORD_HEADER_LENGTH + captured_length
    }
}
