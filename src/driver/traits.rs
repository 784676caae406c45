use anyhow::Result;
use async_trait::async_trait;

/// Device primitives the engine drives.
///
/// Every call blocks until the underlying action has been issued.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Serial of the connected device, if known
    fn serial(&self) -> Option<&str> {
        None
    }

    async fn tap(&self, x: i32, y: i32) -> Result<()>;

    async fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64) -> Result<()>;

    async fn type_text(&self, text: &str) -> Result<()>;

    /// Press a named key ("back", "home", "enter", ...)
    async fn press_key(&self, key: &str) -> Result<()>;

    async fn launch_app(&self, app_id: &str) -> Result<()>;

    async fn terminate_app(&self, app_id: &str) -> Result<()>;

    /// Structural (accessibility tree) lookup; returns the element centre
    async fn find_element_by_text(&self, text: &str) -> Result<Option<(i32, i32)>>;

    async fn screen_size(&self) -> Result<(u32, u32)>;
}

/// Source of in-memory PNG screenshots
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn screenshot(&self) -> Result<Vec<u8>>;
}
