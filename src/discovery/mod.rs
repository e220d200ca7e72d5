//! Local service discovery: coalescing queue, mDNS browse, resolution

pub mod browser;
pub mod listener;
pub mod queue;

pub use {
    browser::{MdnsBrowser, MockServiceBrowser, ServiceBrowser, ServiceDiscoveryEvent},
    listener::{DiscoveryObserver, ResolutionListener},
    queue::DiscoveryQueue,
};
