//! Limits for configuration values.

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy, Debug)]
pub struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Returns the minimum value.
    pub fn min(self) -> T {
        self.min
    }

    /// Returns the maximum value.
    pub fn max(self) -> T {
        self.max
    }

    /// Trims the given value to fit into the minimum/maximum range.
    ///
    /// Works for partially ordered values such as ratios. A value that
    /// compares neither below nor above the range (i.e., NaN) is replaced
    /// by the default.
    pub fn limit(self, value: T) -> T
    where
        T: PartialOrd,
    {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else if value >= self.min {
            value
        } else {
            self.def
        }
    }
}

//============ Testing =======================================================
