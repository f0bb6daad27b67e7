//! Classification of channels relative to hierarchy boundaries.
//!
//! A channel connects a source port to a destination port. When either of
//! them is a port of a composite actor, the channel sits at the edge of that
//! composite, which decides whether it acts as a producer or a consumer at a
//! given composition level. These queries are purely structural and never
//! affect synchronization.

/// The kind of port found at one end of a connection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// A port of an atomic actor.
    #[default]
    Atomic,
    /// An input port of a composite actor.
    CompositeInput,
    /// An output port of a composite actor.
    CompositeOutput,
}

/// Structural position of a channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BoundaryDetector {
    source: PortKind,
    destination: PortKind,
}

impl BoundaryDetector {
    /// Creates a detector for a connection from `source` to `destination`.
    pub fn new(source: PortKind, destination: PortKind) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Kind of the port feeding the channel.
    pub fn source(&self) -> PortKind {
        self.source
    }

    /// Kind of the port the channel belongs to.
    pub fn destination(&self) -> PortKind {
        self.destination
    }

    /// Returns `true` if the channel is fed by a boundary port.
    pub fn is_connected_to_boundary(&self) -> bool {
        self.is_connected_to_boundary_inside() || self.is_connected_to_boundary_outside()
    }

    /// Returns `true` if the channel is fed from the inside face of a
    /// composite input port.
    pub fn is_connected_to_boundary_inside(&self) -> bool {
        self.source == PortKind::CompositeInput
    }

    /// Returns `true` if the channel is fed from the outside face of a
    /// composite output port.
    pub fn is_connected_to_boundary_outside(&self) -> bool {
        self.source == PortKind::CompositeOutput
    }

    /// Returns `true` if the channel lives on the inside face of a composite
    /// output port.
    pub fn is_inside_boundary(&self) -> bool {
        self.destination == PortKind::CompositeOutput
    }

    /// Returns `true` if the channel lives on the outside face of a composite
    /// input port.
    pub fn is_outside_boundary(&self) -> bool {
        self.destination == PortKind::CompositeInput
    }

    /// Returns `true` if the channel consumes data crossing a boundary.
    pub fn is_consumer(&self) -> bool {
        self.is_connected_to_boundary()
    }

    /// Returns `true` if the channel produces data that will cross a boundary.
    pub fn is_producer(&self) -> bool {
        self.is_inside_boundary() || self.is_outside_boundary()
    }
}
