//! Slot admission filters.
//!
//! Filters form a chain consulted in order. Each one either defers to the
//! next or vetoes with a reason shown to the driver. Two hooks exist: a
//! request-level check run during the handshake, and a per-slot check run
//! while the registry scans for a free slot.

use crate::config::ServerConfig;
use crate::slots::{ClientSlot, EntryCar};
use shared::handshake::HandshakeRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Defer,
    Reject(String),
}

pub trait SlotFilter: Send + Sync {
    /// Request-level check before any slot is considered.
    fn should_accept(&self, _request: &HandshakeRequest) -> FilterVerdict {
        FilterVerdict::Defer
    }

    /// Whether `slot` may be given to `guid`. `occupancy` is the number of
    /// currently bound client slots.
    fn is_slot_open(&self, _slot: &ClientSlot, _guid: u64, _occupancy: usize) -> FilterVerdict {
        FilterVerdict::Defer
    }
}

/// Ordered filter chain.
#[derive(Default)]
pub struct SlotFilterChain {
    filters: Vec<Box<dyn SlotFilter>>,
}

impl SlotFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock chain: per-slot allow-lists, AI reservation, name words.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut chain = Self::new();
        chain.push(GuidSlotFilter);
        if config.extra.ai_max_player_count > 0 {
            chain.push(AiSlotFilter {
                max_player_count: config.extra.ai_max_player_count,
            });
        }
        if !config.extra.banned_name_words.is_empty() {
            chain.push(WordFilter::new(&config.extra.banned_name_words));
        }
        chain
    }

    pub fn push(&mut self, filter: impl SlotFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn should_accept(&self, request: &HandshakeRequest) -> Result<(), String> {
        for filter in &self.filters {
            if let FilterVerdict::Reject(reason) = filter.should_accept(request) {
                return Err(reason);
            }
        }
        Ok(())
    }

    pub fn is_slot_open(&self, slot: &ClientSlot, guid: u64, occupancy: usize) -> Result<(), String> {
        for filter in &self.filters {
            if let FilterVerdict::Reject(reason) = filter.is_slot_open(slot, guid, occupancy) {
                return Err(reason);
            }
        }
        Ok(())
    }
}

/// Honours the per-entry guid allow-list.
pub struct GuidSlotFilter;

impl SlotFilter for GuidSlotFilter {
    fn is_slot_open(&self, slot: &ClientSlot, guid: u64, _occupancy: usize) -> FilterVerdict {
        let allowed = &slot.entry().allowed_guids;
        if allowed.is_empty() || allowed.contains(&guid) {
            FilterVerdict::Defer
        } else {
            FilterVerdict::Reject("This slot is reserved.".into())
        }
    }
}

/// Keeps room for AI traffic by capping the number of human drivers.
pub struct AiSlotFilter {
    pub max_player_count: usize,
}

impl SlotFilter for AiSlotFilter {
    fn is_slot_open(&self, _slot: &ClientSlot, _guid: u64, occupancy: usize) -> FilterVerdict {
        if occupancy >= self.max_player_count {
            FilterVerdict::Reject("Remaining slots are reserved for AI traffic.".into())
        } else {
            FilterVerdict::Defer
        }
    }
}

/// Refuses display names containing a banned word, case-insensitively.
pub struct WordFilter {
    words: Vec<String>,
}

impl WordFilter {
    pub fn new(words: &[String]) -> Self {
        Self {
            words: words.iter().map(|w| w.to_lowercase()).collect(),
        }
    }
}

impl SlotFilter for WordFilter {
    fn should_accept(&self, request: &HandshakeRequest) -> FilterVerdict {
        let name = request.name.to_lowercase();
        if self.words.iter().any(|word| name.contains(word.as_str())) {
            FilterVerdict::Reject("Your name contains a banned word.".into())
        } else {
            FilterVerdict::Defer
        }
    }
}
