use core::fmt;

/// Boot stages of the memory subsystem, in the only order they can be
/// reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// No translation of our own; physical equals virtual.
    PrePaging = 0,
    /// All usable RAM identity mapped with 2 MiB pages.
    BootstrapPaging = 1,
    /// Final address space active, frame free list in use.
    SteadyState = 2,
    /// Heap and arenas available.
    HeapReady = 3,
}

impl Stage {
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrePaging => "pre-paging",
            Self::BootstrapPaging => "bootstrap paging",
            Self::SteadyState => "steady state",
            Self::HeapReady => "heap ready",
        };
        write!(f, "stage {} ({name})", self.number())
    }
}
