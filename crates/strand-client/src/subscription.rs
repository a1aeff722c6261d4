use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use strand_core::FrameHeader;
use strand_shm::Image;

use crate::conductor::ClientShared;

struct SubscriptionState {
    registration_id: i64,
    channel: String,
    stream_id: i32,
    images: Mutex<Vec<Image>>,
    closed: AtomicBool,
    client: Weak<ClientShared>,
}

/// Receives fragments from every publication on its channel and stream.
///
/// Images come and go as the conductor hears about them.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(registration_id: i64, channel: String, stream_id: i32, client: Weak<ClientShared>) -> Self {
        Self {
            state: Arc::new(SubscriptionState {
                registration_id,
                channel,
                stream_id,
                images: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                client,
            }),
        }
    }

    /// The correlation id of the command that added this subscription.
    pub fn registration_id(&self) -> i64 {
        self.state.registration_id
    }

    pub fn channel(&self) -> &str {
        &self.state.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.state.stream_id
    }

    /// Number of publications currently being read.
    pub fn image_count(&self) -> usize {
        self.state.images.lock().len()
    }

    /// Whether at least one image is available.
    pub fn is_connected(&self) -> bool {
        self.image_count() > 0
    }

    /// Whether the subscription, or the client it came from, has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Poll each image in turn for up to `fragment_limit` fragments in total.
    pub fn poll<F>(&self, mut handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], &FrameHeader),
    {
        if self.is_closed() {
            return 0;
        }
        let mut images = self.state.images.lock();
        let mut fragments = 0;
        for image in images.iter_mut() {
            if fragments >= fragment_limit {
                break;
            }
            fragments += image.poll(&mut handler, fragment_limit - fragments);
        }
        fragments
    }

    /// Drop every image and tell the driver. Closing twice does nothing.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.images.lock().clear();
        if let Some(client) = self.state.client.upgrade() {
            client.release_subscription(self.state.registration_id);
        }
    }

    pub(crate) fn add_image(&self, image: Image) -> bool {
        let mut images = self.state.images.lock();
        if self.is_closed() || images.iter().any(|i| i.correlation_id() == image.correlation_id()) {
            return false;
        }
        images.push(image);
        true
    }

    pub(crate) fn remove_image(&self, correlation_id: i64) -> bool {
        let mut images = self.state.images.lock();
        let before = images.len();
        images.retain(|image| image.correlation_id() != correlation_id);
        images.len() != before
    }

    pub(crate) fn mark_closed(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.images.lock().clear();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("registration_id", &self.state.registration_id)
            .field("channel", &self.state.channel)
            .field("stream_id", &self.state.stream_id)
            .field("images", &self.image_count())
            .finish()
    }
}
