use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters of the TLAB slow paths, shared by all threads of a heap.
#[derive(Default)]
pub struct TlabStats {
    slow_path_allocations: AtomicUsize,
    overflows: AtomicUsize,
    refills: AtomicUsize,
    leftover_bytes: AtomicUsize,
}

impl TlabStats {
    pub fn record_slow_path(&self) {
        self.slow_path_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// A request that did not fit the TLAB and went straight to the belt.
    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// A TLAB was replaced; `leftover` bytes of the old one were covered with a filler.
    pub fn record_refill(&self, leftover: usize) {
        self.refills.fetch_add(1, Ordering::Relaxed);
        self.leftover_bytes.fetch_add(leftover, Ordering::Relaxed);
    }

    pub fn slow_path_allocations(&self) -> usize {
        self.slow_path_allocations.load(Ordering::Relaxed)
    }
    pub fn overflows(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }
    pub fn refills(&self) -> usize {
        self.refills.load(Ordering::Relaxed)
    }
    pub fn leftover_bytes(&self) -> usize {
        self.leftover_bytes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Display for TlabStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "TLAB statistics:")?;
        writeln!(
            f,
            "  Slow path allocations: {}",
            self.slow_path_allocations()
        )?;
        writeln!(f, "  Overflows to belt: {}", self.overflows())?;
        writeln!(f, "  Refills: {}", self.refills())?;
        let refills = self.refills();
        writeln!(
            f,
            "  Leftover at refill: {} (avg {})",
            formatted_size(self.leftover_bytes()),
            formatted_size(if refills == 0 {
                0
            } else {
                self.leftover_bytes() / refills
            })
        )
    }
}

pub struct HeapStatistics {
    pub belt_reserved: usize,
    pub belt_used: usize,
    pub belt_free: usize,
    pub immortal_used: usize,
    pub immortal_size: usize,
    pub total_gc_cycles_count: usize,
    pub mutators: usize,
    pub pending_references: bool,
    pub finalizees: usize,
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Belts: {} used, {} free, {} reserved",
            formatted_size(self.belt_used),
            formatted_size(self.belt_free),
            formatted_size(self.belt_reserved)
        )?;
        writeln!(
            f,
            "  Immortal region: {} of {}",
            formatted_size(self.immortal_used),
            formatted_size(self.immortal_size)
        )?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(f, "  Attached mutators: {}", self.mutators)?;
        writeln!(f, "  Registered finalizees: {}", self.finalizees)?;
        writeln!(
            f,
            "  References pending: {}",
            if self.pending_references { "yes" } else { "no" }
        )?;
        Ok(())
    }
}
