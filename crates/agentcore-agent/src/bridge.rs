use tokio::sync::Mutex;

use crate::fence::ToolOrigin;
use agentcore_sessions::types::SessionKey;

/// The session/origin context an out-of-band tool handler (e.g. an MCP
/// server process) reads while a tool call is in flight (spec §5/§9 —
/// "MCP context bridge").
#[derive(Debug, Clone)]
pub struct BridgeContext {
    pub session_key: SessionKey,
    pub origin: ToolOrigin,
}

/// Single-slot bridge set immediately before tool dispatch and read by
/// handlers that don't receive session context through their normal call
/// signature. Only one tool call is ever in flight per runner iteration,
/// so a single mutex-guarded slot is sufficient — it is not a queue.
#[derive(Default)]
pub struct ContextBridge {
    slot: Mutex<Option<BridgeContext>>,
}

impl ContextBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, ctx: BridgeContext) {
        *self.slot.lock().await = Some(ctx);
    }

    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }

    pub async fn get(&self) -> Option<BridgeContext> {
        self.slot.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let bridge = ContextBridge::new();
        let key = SessionKey::new("u1", "main", "main");
        bridge
            .set(BridgeContext {
                session_key: key.clone(),
                origin: ToolOrigin::App,
            })
            .await;
        let read = bridge.get().await.unwrap();
        assert_eq!(read.session_key, key);
        assert_eq!(read.origin, ToolOrigin::App);
    }

    #[tokio::test]
    async fn clear_empties_slot() {
        let bridge = ContextBridge::new();
        bridge
            .set(BridgeContext {
                session_key: SessionKey::new("u1", "main", "main"),
                origin: ToolOrigin::User,
            })
            .await;
        bridge.clear().await;
        assert!(bridge.get().await.is_none());
    }
}
