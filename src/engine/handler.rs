use crate::device::Device;


/// Gets notified about ranging events
///
/// All methods are called from [`RangingEngine::run_once`], with the record of
/// the device concerned. They have empty default implementations, so only the
/// events of interest need to be implemented.
///
/// [`RangingEngine::run_once`]: super::RangingEngine::run_once
pub trait Handler {
    /// A new range measurement was stored in `device.range`
    ///
    /// Called on the anchor, which computes the range, and on the tag, when it
    /// receives the anchor's report.
    fn new_range(&mut self, _device: &Device) {}

    /// An anchor heard a blink from a tag it didn't know
    fn blink_device(&mut self, _device: &Device) {}

    /// A tag learned about a new anchor
    fn new_device(&mut self, _device: &Device) {}

    /// A device wasn't heard from for too long
    fn inactive_device(&mut self, _device: &Device) {}
}

impl Handler for () {}
