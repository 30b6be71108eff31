/// What the station link did since the previous check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Restored,
    Lost,
    Down { for_ms: u64 },
    Expired { for_ms: u64 },
}

/// Tracks how long the link has been down, on the control loop's clock.
#[derive(Debug)]
pub struct OutageTimer {
    grace_ms: u64,
    down_since_ms: Option<u64>,
}

impl OutageTimer {
    pub fn new(grace_ms: u64) -> Self {
        Self {
            grace_ms,
            down_since_ms: None,
        }
    }

    pub fn observe(&mut self, connected: bool, now_ms: u64) -> LinkEvent {
        if connected {
            return match self.down_since_ms.take() {
                Some(_) => LinkEvent::Restored,
                None => LinkEvent::Up,
            };
        }

        let Some(since) = self.down_since_ms else {
            self.down_since_ms = Some(now_ms);
            return LinkEvent::Lost;
        };
        let for_ms = now_ms.saturating_sub(since);
        if for_ms >= self.grace_ms {
            LinkEvent::Expired { for_ms }
        } else {
            LinkEvent::Down { for_ms }
        }
    }
}
