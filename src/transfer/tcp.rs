//! Transfer over a TCP stream. The stream guarantees ordering and delivery, so this only keeps
//!  the connection's sequence numbering on top: there are no retransmissions and no congestion
//!  window, and only the fin is acknowledged.

use std::cmp::min;

use bytes::{BufMut, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::TcpTransferConfig;
use crate::error::{BdtError, BdtResult};
use crate::package::{CommandType, Package, PackageFlags};
use crate::send_buffer::{SendBuffer, SendBufferSignal};
use crate::sequence::SeqNum;
use crate::transfer::{FinState, Transfer, TransferEvent, TransferHost};

pub struct TcpTransfer {
    config: TcpTransferConfig,
    send_buffer: SendBuffer,

    next_seq: SeqNum,
    next_remote_seq: SeqNum,
    /// cleared when the stream reports back pressure
    writable: bool,

    fin: FinState,
    /// the ack that covers our fin
    fin_ack_seq: Option<SeqNum>,
    remote_fin: bool,
}

impl TcpTransfer {
    pub fn new(config: TcpTransferConfig, next_seq: SeqNum, next_remote_seq: SeqNum) -> TcpTransfer {
        TcpTransfer {
            send_buffer: SendBuffer::new(config.send_buffer_capacity, config.send_buffer_drain_size),
            config,
            next_seq,
            next_remote_seq,
            writable: true,
            fin: FinState::Open,
            fin_ack_seq: None,
            remote_fin: false,
        }
    }

    fn post(&mut self, host: &mut dyn TransferHost, mut package: Package) {
        package.header.flags.insert(PackageFlags::TCP);
        package.header.seq = self.next_seq;
        package.header.ack_seq = self.next_remote_seq;
        self.next_seq = package.next_seq();
        host.post_package(&mut package);
    }

    fn flush(&mut self, host: &mut dyn TransferHost) {
        while self.writable && !self.send_buffer.is_empty() {
            let (chunks, signals) = self.send_buffer.head(self.config.max_package_data);

            let mut data = BytesMut::with_capacity(min(self.config.max_package_data, chunks.iter().map(|c| c.len()).sum()));
            for chunk in chunks {
                data.put_slice(&chunk);
            }
            let mut package = host.new_package(CommandType::Data);
            package.data = data.freeze();
            self.post(host, package);

            if signals.contains(&SendBufferSignal::Drain) {
                host.emit(TransferEvent::Drain);
            }
        }

        if self.writable && self.send_buffer.is_empty() && self.fin == FinState::Queued {
            let package = host.new_package(CommandType::Fin);
            self.post(host, package);
            self.fin_ack_seq = Some(self.next_seq);
            self.fin = FinState::Sent;
            debug!("sent fin over tcp");
        }
    }

    fn send_ack(&mut self, host: &mut dyn TransferHost) {
        let mut package = host.new_package(CommandType::Data);
        package.header.flags.insert(PackageFlags::TCP);
        package.header.seq = self.next_seq;
        package.header.ack_seq = self.next_remote_seq;
        host.post_package(&mut package);
    }
}

impl Transfer for TcpTransfer {
    fn send(&mut self, host: &mut dyn TransferHost, data: &[u8], _now: Instant) -> BdtResult<usize> {
        if self.fin != FinState::Open {
            return Err(BdtError::InvalidState);
        }
        let accepted = self.send_buffer.push(data)?;
        self.flush(host);
        Ok(accepted)
    }

    fn close(&mut self, host: &mut dyn TransferHost, _now: Instant) {
        if self.fin == FinState::Open {
            self.fin = FinState::Queued;
            self.flush(host);
        }
    }

    fn on_package(&mut self, host: &mut dyn TransferHost, package: &Package, _now: Instant) {
        if let Some(fin_ack_seq) = self.fin_ack_seq {
            if self.fin == FinState::Sent && package.header.ack_seq >= fin_ack_seq {
                debug!("fin acknowledged");
                self.fin = FinState::Acked;
                host.emit(TransferEvent::CloseAcked);
            }
        }

        let is_fin = match package.cmd_type() {
            CommandType::Fin => true,
            CommandType::Data if package.has_payload() => false,
            CommandType::Data => return,
            other => {
                trace!("ignoring {:?} in transfer", other);
                return;
            }
        };

        let seq = package.header.seq;
        if seq < self.next_remote_seq {
            trace!("dropping duplicate {:?}", package);
            if is_fin {
                self.send_ack(host);
            }
            return;
        }
        if seq > self.next_remote_seq {
            // cannot happen on an intact stream
            debug!("gap in tcp stream: expected {:?}, got {:?} - dropping", self.next_remote_seq, seq);
            return;
        }

        self.next_remote_seq = package.next_seq();
        if is_fin {
            if !self.remote_fin {
                debug!("received fin over tcp");
                self.remote_fin = true;
                host.emit(TransferEvent::EndOfStream);
            }
            self.send_ack(host);
        }
        else if !self.remote_fin {
            host.emit(TransferEvent::Data(package.data.clone()));
        }
    }

    fn on_timer(&mut self, _host: &mut dyn TransferHost, _now: Instant) {
    }

    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn on_stream_busy(&mut self) {
        trace!("tcp stream busy - pausing");
        self.writable = false;
    }

    fn on_stream_writable(&mut self, host: &mut dyn TransferHost, _now: Instant) {
        self.writable = true;
        self.flush(host);
    }
}
