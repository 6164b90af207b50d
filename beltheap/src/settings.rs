use crate::address::WORD_SIZE;

/// Configuration for a belt heap. All values are fixed for the lifetime of
/// one heap instance.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total usable heap size in bytes (rounded up to TLAB granularity).
    pub heap_size: usize,
    /// One entry per belt, youngest first; percentage of `heap_size`.
    /// Must sum to at most 100.
    pub belt_percentages: Vec<u32>,
    /// Number of worker threads participating in a parallel cycle.
    pub gc_threads: usize,
    /// Nominal mutator TLAB size; must be a multiple of `span_size`.
    pub tlab_size: usize,
    /// Nominal evacuation TLAB size; must be a multiple of `span_size`.
    pub gc_tlab_size: usize,
    /// Card and side-table granularity in bytes; power of two.
    pub span_size: usize,
    /// Requests below this go through the TLAB; larger ones hit the belt
    /// directly.
    pub direct_allocation_threshold: usize,
    /// Evacuate with parallel workers instead of a single linear pass.
    pub parallel: bool,
    /// Run the opt-in heap consistency check in the cycle epilogue.
    pub verify: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 64 << 20,                   // 64 MB
            belt_percentages: vec![10, 20, 70],    // eden / to / mature
            gc_threads: 2,
            tlab_size: 8192,
            gc_tlab_size: 2048,
            span_size: 512,
            direct_allocation_threshold: 4096,
            parallel: true,
            verify: false,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 || self.tlab_size == 0 || self.gc_tlab_size == 0 {
            return Err("sizes must be > 0");
        }
        if !self.span_size.is_power_of_two() {
            return Err("span_size must be a power of two");
        }
        if self.span_size < 4 * WORD_SIZE {
            return Err("span_size too small to hold a cell");
        }
        if !self.tlab_size.is_multiple_of(self.span_size)
            || !self.gc_tlab_size.is_multiple_of(self.span_size)
        {
            return Err("TLAB sizes must be multiples of span_size");
        }
        if self.belt_percentages.len() < 2 {
            return Err("at least two belts are required");
        }
        if self.belt_percentages.iter().any(|&p| p == 0) {
            return Err("belt percentages must be > 0");
        }
        if self.belt_percentages.iter().sum::<u32>() > 100 {
            return Err("belt percentages must sum to at most 100");
        }
        if self.gc_threads == 0 {
            return Err("gc_threads must be > 0");
        }
        if self.heap_size < self.belt_percentages.len() * self.tlab_size {
            return Err("heap too small for the configured belt count");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_non_power_of_two_span() {
        let settings = HeapSettings {
            span_size: 500,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_misaligned_tlab() {
        let settings = HeapSettings {
            tlab_size: 1000,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_single_belt() {
        let settings = HeapSettings {
            belt_percentages: vec![100],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_over_100_percent() {
        let settings = HeapSettings {
            belt_percentages: vec![60, 60],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
