//! The tag lifecycle engine.
//!
//! One [`Reader`] owns the transport and everything the operator surface
//! reads or mutates: the live inventory, the activity mode, the event sink,
//! and the counters. The inventory, mode, and sink share a single mutex;
//! the transport sits behind its own async mutex so no two reader
//! operations ever overlap on the RF interface, and no lock is held across
//! a transport call's await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::events::{EsMsg, StreamBusy, Subscription, PUBLISH_DEADLINE, SUBSCRIBE_WAIT};
use crate::tag::{InventoryMap, Tag, TagContent, Uid, CONTENT_BLOCKS};
use crate::transport::{Counters, ReaderError, ReaderInfo, Transport};

const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// What kind of RF activity is allowed right now. Only the scan loop acts
/// on `Scan`; every other non-idle mode belongs to one operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    /// Present in the reader's mode table but never entered by the bridge.
    #[allow(dead_code)]
    Read,
    ReadOnce,
    Write,
    WriteAfi,
    Scan,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "IDLE",
            Mode::Read => "READ",
            Mode::ReadOnce => "READONCE",
            Mode::Write => "WRITE",
            Mode::WriteAfi => "WRITEAFI",
            Mode::Scan => "SCAN",
        }
    }
}

struct State {
    mode: Mode,
    inventory: InventoryMap,
    sink: Option<(u64, mpsc::Sender<EsMsg>)>,
}

/// Restores the previous mode when the operation holding it finishes.
struct ModeGuard<'a> {
    reader: &'a Reader,
    prev: Mode,
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.reader.state.lock().unwrap().mode = self.prev;
    }
}

pub struct Reader {
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    state: Mutex<State>,
    gate: Arc<Semaphore>,
    next_sink_id: AtomicU64,
    pub counters: Arc<Counters>,
    pub info: ReaderInfo,
    started: Instant,
    keep_awake: bool,
    country: String,
    library: String,
}

impl Reader {
    pub fn new(
        transport: Box<dyn Transport>,
        info: ReaderInfo,
        counters: Arc<Counters>,
        keep_awake: bool,
        country: String,
        library: String,
    ) -> Arc<Reader> {
        Arc::new(Reader {
            transport: tokio::sync::Mutex::new(transport),
            state: Mutex::new(State {
                mode: Mode::Idle,
                inventory: InventoryMap::new(),
                sink: None,
            }),
            gate: Arc::new(Semaphore::new(1)),
            next_sink_id: AtomicU64::new(0),
            counters,
            info,
            started: Instant::now(),
            keep_awake,
            country,
            library,
        })
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().unwrap().mode
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state.lock().unwrap().mode = mode;
    }

    fn enter_mode(&self, mode: Mode) -> ModeGuard<'_> {
        let mut st = self.state.lock().unwrap();
        let prev = st.mode;
        st.mode = mode;
        ModeGuard { reader: self, prev }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> InventoryMap {
        self.state.lock().unwrap().inventory.clone()
    }

    pub fn inventory_is_empty(&self) -> bool {
        self.state.lock().unwrap().inventory.is_empty()
    }

    /// Background scan loop. Ticks every 100 ms; a sweep that overruns its
    /// tick simply swallows the missed ticks instead of bursting.
    pub async fn run(self: Arc<Self>) {
        let mut tick = interval(SCAN_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if self.mode() != Mode::Scan {
                continue;
            }
            let mut link = self.transport.lock().await;
            if let Err(e) = self.sweep(link.as_mut()).await {
                debug!("sweep failed: {e}");
            }
        }
    }

    /// One-shot sweep for the `scan` endpoint; runs regardless of the
    /// background mode and returns the resulting inventory.
    pub async fn read_once(&self) -> InventoryMap {
        let mut link = self.transport.lock().await;
        let _mode = self.enter_mode(Mode::ReadOnce);
        if let Err(e) = self.sweep(link.as_mut()).await {
            debug!("one-shot sweep failed: {e}");
        }
        self.snapshot()
    }

    /// Inventory the field and diff it against the maintained tag map:
    /// read content for arrivals, drop departures, publish both.
    async fn sweep(&self, link: &mut dyn Transport) -> Result<(), ReaderError> {
        let inv = match link.inventory().await {
            Ok(inv) => {
                self.counters.read_inv_succ.fetch_add(1, Ordering::Relaxed);
                inv
            }
            Err(e) if e.is_transient() => return Ok(()),
            Err(e) => {
                self.counters.read_inv_fail.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        for (uid, seen) in &inv.tags {
            let known = self.state.lock().unwrap().inventory.contains_key(uid);
            if known {
                continue;
            }
            match self.read_content(link, seen).await {
                Ok(tag) => {
                    self.counters.read_tag_succ.fetch_add(1, Ordering::Relaxed);
                    info!(uid = %uid, "tag entered range");
                    self.state
                        .lock()
                        .unwrap()
                        .inventory
                        .insert(*uid, tag.clone());
                    self.publish("addTag", &tag).await;
                }
                // Transients resolve themselves; the tag is retried on the
                // next sweep either way.
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    self.counters.read_tag_fail.fetch_add(1, Ordering::Relaxed);
                    debug!(uid = %uid, "failed to read tag content: {e}");
                }
            }
        }

        let gone: Vec<Tag> = {
            let mut st = self.state.lock().unwrap();
            let departed: Vec<Uid> = st
                .inventory
                .keys()
                .filter(|uid| !inv.tags.contains_key(*uid))
                .copied()
                .collect();
            departed
                .iter()
                .filter_map(|uid| st.inventory.remove(uid))
                .collect()
        };
        for tag in gone {
            info!(uid = %tag.uid, "tag left range");
            self.publish("removeTag", &tag).await;
        }

        if self.keep_awake {
            let _ = link.reset_to_ready().await;
        }
        Ok(())
    }

    async fn read_content(
        &self,
        link: &mut dyn Transport,
        seen: &Tag,
    ) -> Result<Tag, ReaderError> {
        let raw = link.read_blocks(seen.uid, 0, CONTENT_BLOCKS).await?;
        let content = TagContent::decode(&raw)?;
        Ok(Tag {
            content: Some(content),
            ..seen.clone()
        })
    }

    /// Write `barcode` to every tag currently in the inventory, numbering
    /// them as one set.
    pub async fn write_barcode_all(&self, barcode: &str) -> Result<InventoryMap, ReaderError> {
        let mut link = self.transport.lock().await;
        let _mode = self.enter_mode(Mode::Write);
        let tags: Vec<Tag> = {
            let st = self.state.lock().unwrap();
            st.inventory.values().cloned().collect()
        };
        let total = tags.len() as u8;
        for (i, mut tag) in tags.into_iter().enumerate() {
            let content = TagContent {
                seq_num: i as u8 + 1,
                num_items: total,
                barcode: barcode.to_string(),
                crc: None,
                country: self.country.clone(),
                library: self.library.clone(),
            };
            link.write_blocks(tag.uid, 0, CONTENT_BLOCKS, &content.to_blocks())
                .await?;
            info!(uid = %tag.uid, barcode, seq = content.seq_num, "tag written");
            tag.content = Some(content);
            self.state.lock().unwrap().inventory.insert(tag.uid, tag);
        }
        Ok(self.snapshot())
    }

    /// Rewrite a single tag's barcode, keeping its other fields. Returns
    /// `None` when the tag is not in the inventory.
    pub async fn write_tag_barcode(
        &self,
        uid: Uid,
        barcode: &str,
    ) -> Result<Option<Tag>, ReaderError> {
        let mut link = self.transport.lock().await;
        let _mode = self.enter_mode(Mode::Write);
        let Some(mut tag) = self.state.lock().unwrap().inventory.get(&uid).cloned() else {
            return Ok(None);
        };
        let mut content = tag.content.take().unwrap_or_default();
        content.barcode = barcode.to_string();
        link.write_blocks(uid, 0, CONTENT_BLOCKS, &content.to_blocks())
            .await?;
        info!(uid = %uid, barcode, "tag barcode rewritten");
        tag.content = Some(content);
        self.state
            .lock()
            .unwrap()
            .inventory
            .insert(uid, tag.clone());
        Ok(Some(tag))
    }

    /// Flip the AFI anti-theft byte on every tag in the inventory. On
    /// failure reports which tag refused.
    pub async fn set_afi_all(&self, afi: u8) -> Result<(), (Uid, ReaderError)> {
        let mut link = self.transport.lock().await;
        let _mode = self.enter_mode(Mode::WriteAfi);
        let uids: Vec<Uid> = {
            let st = self.state.lock().unwrap();
            st.inventory.keys().copied().collect()
        };
        for uid in uids {
            link.write_afi(uid, afi).await.map_err(|e| (uid, e))?;
            info!(uid = %uid, afi = format_args!("{afi:#04X}"), "AFI written");
        }
        Ok(())
    }

    /// Attach the one allowed event consumer, waiting briefly for the
    /// previous one to let go. The inventory is cleared so the new consumer
    /// receives a full set of adds on the next sweep.
    pub async fn subscribe(self: Arc<Self>) -> Result<Subscription, StreamBusy> {
        let permit = match timeout(SUBSCRIBE_WAIT, self.gate.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(StreamBusy),
        };
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut st = self.state.lock().unwrap();
            st.inventory.clear();
            st.sink = Some((id, tx));
        }
        info!("event stream attached");
        Ok(Subscription::new(rx, id, self, permit))
    }

    pub(crate) fn detach_sink(&self, id: u64) {
        let mut st = self.state.lock().unwrap();
        if matches!(st.sink, Some((sid, _)) if sid == id) {
            st.sink = None;
            info!("event stream detached");
        }
    }

    /// Deliver an event to the current sink, or drop it after the deadline.
    async fn publish(&self, event: &'static str, tag: &Tag) {
        let tx = {
            let st = self.state.lock().unwrap();
            st.sink.as_ref().map(|(_, tx)| tx.clone())
        };
        let Some(tx) = tx else { return };
        if tx.send_timeout(EsMsg::tag(event, tag), PUBLISH_DEADLINE).await.is_err() {
            debug!(event, "event dropped");
        }
    }

    /// Shut the transport down explicitly; called once on exit.
    pub async fn close(&self) {
        let mut link = self.transport.lock().await;
        if let Err(e) = link.close().await {
            debug!("closing reader transport: {e}");
        }
    }
}
