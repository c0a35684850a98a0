// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! An in-memory transfer engine for exercising the deal machines.

use crate::{ChannelEvent, ChannelId, DataTransfer, Error, Event, Voucher};
use async_std::sync::Mutex as AsyncMutex;
use async_trait::async_trait;
use cid::Cid;
use flo_stream::{MessagePublisher, Publisher, Subscriber};
use fvm_ipld_encoding::RawBytes;
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct OpenedChannel {
    pub to: PeerId,
    pub voucher: Voucher,
    pub root: Cid,
    pub pull: bool,
}

/// Records every call and lets the test replay engine events.
pub struct TestDataTransfer {
    self_peer: PeerId,
    next_id: AtomicU64,
    pub opened: Mutex<Vec<OpenedChannel>>,
    pub vouchers_sent: Mutex<Vec<(ChannelId, Voucher)>>,
    pub voucher_results_sent: Mutex<Vec<(ChannelId, Voucher)>>,
    pub closed: Mutex<Vec<ChannelId>>,
    pub restarted: Mutex<Vec<ChannelId>>,
    pub fail_open: Mutex<Option<String>>,
    publisher: AsyncMutex<Publisher<ChannelEvent>>,
}

impl TestDataTransfer {
    pub fn new(self_peer: PeerId) -> Self {
        TestDataTransfer {
            self_peer,
            next_id: AtomicU64::new(1),
            opened: Mutex::new(Vec::new()),
            vouchers_sent: Mutex::new(Vec::new()),
            voucher_results_sent: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            restarted: Mutex::new(Vec::new()),
            fail_open: Mutex::new(None),
            publisher: AsyncMutex::new(Publisher::new(16)),
        }
    }

    /// Replays an engine event to every subscriber.
    pub async fn publish(&self, channel_id: ChannelId, voucher: Voucher, event: Event) {
        self.publisher
            .lock()
            .await
            .publish(ChannelEvent {
                channel_id,
                voucher,
                event,
            })
            .await;
    }

    fn open(&self, to: PeerId, voucher: Voucher, root: Cid, pull: bool) -> Result<ChannelId, Error> {
        if let Some(msg) = self.fail_open.lock().clone() {
            return Err(Error::Other(msg));
        }
        self.opened.lock().push(OpenedChannel {
            to,
            voucher,
            root,
            pull,
        });
        Ok(ChannelId {
            initiator: self.self_peer,
            responder: to,
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl DataTransfer for TestDataTransfer {
    async fn open_push_channel(
        &self,
        to: PeerId,
        voucher: Voucher,
        root: Cid,
        _selector: Option<RawBytes>,
    ) -> Result<ChannelId, Error> {
        self.open(to, voucher, root, false)
    }

    async fn open_pull_channel(
        &self,
        to: PeerId,
        voucher: Voucher,
        root: Cid,
        _selector: Option<RawBytes>,
    ) -> Result<ChannelId, Error> {
        self.open(to, voucher, root, true)
    }

    async fn send_voucher(&self, channel_id: ChannelId, voucher: Voucher) -> Result<(), Error> {
        self.vouchers_sent.lock().push((channel_id, voucher));
        Ok(())
    }

    async fn send_voucher_result(
        &self,
        channel_id: ChannelId,
        voucher: Voucher,
    ) -> Result<(), Error> {
        self.voucher_results_sent.lock().push((channel_id, voucher));
        Ok(())
    }

    async fn close_channel(&self, channel_id: ChannelId) -> Result<(), Error> {
        self.closed.lock().push(channel_id);
        Ok(())
    }

    async fn restart_channel(&self, channel_id: ChannelId) -> Result<(), Error> {
        self.restarted.lock().push(channel_id);
        Ok(())
    }

    async fn subscribe(&self) -> Subscriber<ChannelEvent> {
        self.publisher.lock().await.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;
    use futures::StreamExt;

    #[test]
    fn voucher_round_trip_through_fake_engine() {
        task::block_on(async {
            let dt = TestDataTransfer::new(shared::testutil::random_peer());
            let to = shared::testutil::random_peer();
            let voucher = Voucher {
                type_identifier: "TestVoucher".to_string(),
                data: RawBytes::new(vec![1, 2, 3]),
            };
            let chid = dt
                .open_pull_channel(to, voucher.clone(), shared::testutil::random_cid(), None)
                .await
                .unwrap();
            assert_eq!(chid.responder, to);

            let mut sub = dt.subscribe().await;
            dt.publish(chid.clone(), voucher.clone(), Event::Completed)
                .await;
            let evt = sub.next().await.unwrap();
            assert_eq!(evt.channel_id, chid);
            assert!(matches!(evt.event, Event::Completed));
            assert_eq!(dt.opened.lock()[0].voucher, voucher);
        })
    }
}
