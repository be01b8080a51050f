use crate::Address;

/// A routine (function) defined by an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    /// Possibly decorated routine name.
    pub name: String,

    /// Entry address.
    pub address: Address,
}

/// A symbol-table entry of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,

    /// Link-time value; add [`Image::load_offset`] for the runtime address.
    pub value: u64,
}

/// A loaded executable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Full path of the image.
    pub name: String,

    /// Lowest mapped address.
    pub low_address: Address,

    /// Highest mapped address (inclusive).
    pub high_address: Address,

    /// Difference between runtime and link-time addresses.
    pub load_offset: u64,

    /// Routines defined by the image.
    pub routines: Vec<Routine>,

    /// Symbol-table entries.
    pub symbols: Vec<Symbol>,
}

impl Image {
    /// Creates an image spanning `[low, high]` without routines or symbols.
    pub fn new(name: impl Into<String>, low: impl Into<Address>, high: impl Into<Address>) -> Self {
        let low_address = low.into();

        Self {
            name: name.into(),
            low_address,
            high_address: high.into(),
            load_offset: low_address.0,
            routines: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// Adds a routine.
    pub fn with_routine(mut self, name: impl Into<String>, address: impl Into<Address>) -> Self {
        self.routines.push(Routine {
            name: name.into(),
            address: address.into(),
        });
        self
    }

    /// Adds a symbol-table entry.
    pub fn with_symbol(mut self, name: impl Into<String>, value: u64) -> Self {
        self.symbols.push(Symbol {
            name: name.into(),
            value,
        });
        self
    }

    /// Returns the file name component of [`name`](Self::name).
    pub fn basename(&self) -> &str {
        basename(&self.name)
    }

    /// Returns `true` if the image maps `address`.
    pub fn contains(&self, address: Address) -> bool {
        self.low_address <= address && address <= self.high_address
    }
}

/// Returns the component after the last path separator.
pub fn basename(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}
