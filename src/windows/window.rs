//! A single expansion window

use crate::hardware::Span;

use super::routing::{RoutingConfig, BASE_FIELD_MAX};

/// What a window is reserved for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRole {
    /// Hard-wired onto the CPP bus's own register block
    Control,
    /// Pre-programmed explicit-transaction window for group 0..3
    Explicit(u8),
    /// Generic window reprogrammed on demand for areas
    Bulk,
}

/// Size class of a window: 1-based position of the highest set bit of
/// `len - 1`, i.e. `log2(len)` for powers of two
pub fn size_class(len: u64) -> u32 {
    if len <= 1 {
        return 0;
    }
    u64::BITS - (len - 1).leading_zeros()
}

/// An expansion window carved out of one memory resource
#[derive(Debug, Clone)]
pub struct Window {
    /// Expansion index: `resource * 8 + slot`
    pub index: usize,
    /// Backing memory resource
    pub resource: usize,
    /// Location of the window inside its resource
    pub span: Span,
    /// Host physical address of the first byte
    pub phys_base: u64,
    /// Size class in bits
    pub size_class: u32,
    role: WindowRole,
    routing: Option<RoutingConfig>,
    users: u32,
}

impl Window {
    /// Create a bulk window with no routing programmed
    pub fn new(index: usize, resource: usize, span: Span, phys_base: u64) -> Self {
        Self {
            index,
            resource,
            span,
            phys_base,
            size_class: size_class(span.len),
            role: WindowRole::Bulk,
            routing: None,
            users: 0,
        }
    }

    /// Addressable length of the window
    pub fn len(&self) -> u64 {
        self.span.len
    }

    pub fn role(&self) -> WindowRole {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: WindowRole) {
        self.role = role;
    }

    /// Routing currently programmed into the window, if any
    pub fn routing(&self) -> Option<RoutingConfig> {
        self.routing
    }

    pub(crate) fn set_routing(&mut self, routing: Option<RoutingConfig>) {
        self.routing = routing;
    }

    /// Number of acquired areas routed through this window
    pub fn users(&self) -> u32 {
        self.users
    }

    pub(crate) fn add_user(&mut self) {
        self.users += 1;
    }

    pub(crate) fn remove_user(&mut self) {
        debug_assert!(self.users > 0, "window {} has no users", self.index);
        self.users = self.users.saturating_sub(1);
    }

    pub fn is_bulk(&self) -> bool {
        self.role == WindowRole::Bulk
    }

    /// Offset inside the window at which `address` appears
    pub fn window_offset(&self, address: u64) -> u64 {
        address & ((1u64 << self.size_class) - 1)
    }

    /// Whether `[address, address + size)` fits inside one aligned window
    /// of this size class and its base is expressible in the routing word
    pub fn can_hold(&self, address: u64, size: u64) -> bool {
        if size == 0 || size > self.len() {
            return false;
        }
        let last = match address.checked_add(size - 1) {
            Some(last) => last,
            None => return false,
        };
        let base = address >> self.size_class;
        base == last >> self.size_class
            && base <= BASE_FIELD_MAX
            && self.window_offset(address) + size <= self.len()
    }
}
