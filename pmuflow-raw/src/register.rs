//! Typed register layouts
//!
//! Every control register the agent programs has a structured layout in this
//! crate. Layouts convert to and from the raw 64-bit value that ends up in an
//! MSR, a PCI configuration dword pair, or an MMIO word.

/// Conversion between a structured register layout and its raw value
///
/// # Example
///
/// ```
/// use pmuflow_raw::register::RegisterLayout;
///
/// #[derive(Debug, Default)]
/// struct MyControl {
///     enable: bool,
///     threshold: u8,
/// }
///
/// impl RegisterLayout for MyControl {
///     fn to_raw(&self) -> u64 {
///         (if self.enable { 1 } else { 0 }) | ((self.threshold as u64) << 8)
///     }
///
///     fn from_raw(value: u64) -> Self {
///         Self {
///             enable: (value & 1) != 0,
///             threshold: ((value >> 8) & 0xFF) as u8,
///         }
///     }
/// }
///
/// assert_eq!(MyControl { enable: true, threshold: 2 }.to_raw(), 0x201);
/// ```
pub trait RegisterLayout: Sized {
    /// Convert this layout to the raw register value
    fn to_raw(&self) -> u64;

    /// Parse a raw register value into this layout
    fn from_raw(value: u64) -> Self;

    /// Validate that the fields fit their bit ranges
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// A register address paired with a typed layout
#[derive(Debug, Clone, Copy)]
pub struct Register<T: RegisterLayout> {
    /// MSR address or configuration-space offset
    pub address: u64,
    /// Typed register layout
    pub layout: T,
}

impl<T: RegisterLayout> Register<T> {
    pub fn new(address: u64, layout: T) -> Self {
        Self { address, layout }
    }

    pub fn with_address(address: u64) -> Self
    where
        T: Default,
    {
        Self {
            address,
            layout: T::default(),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        self.layout.validate()
    }

    pub fn to_raw(&self) -> u64 {
        self.layout.to_raw()
    }

    /// Replace the layout with the decoded form of `value`
    pub fn load(&mut self, value: u64) {
        self.layout = T::from_raw(value);
    }
}

/// Mask covering the low `width` bits of a counter
pub const fn counter_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Extract bits `[lo, hi]` (inclusive) of `value`
pub const fn extract_bits(value: u64, lo: u32, hi: u32) -> u64 {
    let width = hi - lo + 1;
    (value >> lo) & counter_mask(width)
}
