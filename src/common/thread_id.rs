use core::fmt;

/// A single hardware thread on the device.
///
/// The derived ordering is row-major: tile, then slice, subslice, eu and
/// finally the thread within the EU. Registry iteration and event grouping
/// rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    /// Tile (sub-device) index.
    pub tile: u32,
    /// Physical slice index within the tile.
    pub slice: u32,
    /// Subslice index within the slice.
    pub subslice: u32,
    /// EU index within the subslice.
    pub eu: u32,
    /// Thread index within the EU.
    pub thread: u32,
}

impl ThreadId {
    /// Create a new `ThreadId`.
    pub const fn new(tile: u32, slice: u32, subslice: u32, eu: u32, thread: u32) -> ThreadId {
        ThreadId {
            tile,
            slice,
            subslice,
            eu,
            thread,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile {} slice {} subslice {} eu {} thread {}",
            self.tile, self.slice, self.subslice, self.eu, self.thread
        )
    }
}

/// A thread (or group of threads) as addressed by a debugger.
///
/// Any field may be set to [`DeviceThread::ALL_INDICES`] to select every
/// value of that field. The `slice` index is logical: on a root session it
/// counts the enabled slices of every tile in order, on a tile session only
/// the slices of that tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceThread {
    /// Logical slice index.
    pub slice: u32,
    /// Subslice index.
    pub subslice: u32,
    /// EU index.
    pub eu: u32,
    /// Thread index.
    pub thread: u32,
}

impl DeviceThread {
    /// Wildcard value matching every index of a field.
    pub const ALL_INDICES: u32 = u32::MAX;

    /// Every thread of the device.
    pub const ALL: DeviceThread = DeviceThread {
        slice: Self::ALL_INDICES,
        subslice: Self::ALL_INDICES,
        eu: Self::ALL_INDICES,
        thread: Self::ALL_INDICES,
    };

    /// Create a new `DeviceThread`.
    pub const fn new(slice: u32, subslice: u32, eu: u32, thread: u32) -> DeviceThread {
        DeviceThread {
            slice,
            subslice,
            eu,
            thread,
        }
    }

    /// Whether every field is a wildcard.
    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    /// Whether no field is a wildcard.
    pub fn is_single(&self) -> bool {
        self.slice != Self::ALL_INDICES
            && self.subslice != Self::ALL_INDICES
            && self.eu != Self::ALL_INDICES
            && self.thread != Self::ALL_INDICES
    }

    /// Whether `single` is one of the threads selected by `self`.
    pub fn contains(&self, single: &DeviceThread) -> bool {
        fn field_matches(group: u32, single: u32) -> bool {
            group == DeviceThread::ALL_INDICES || group == single
        }

        field_matches(self.slice, single.slice)
            && field_matches(self.subslice, single.subslice)
            && field_matches(self.eu, single.eu)
            && field_matches(self.thread, single.thread)
    }
}

impl fmt::Display for DeviceThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field(f: &mut fmt::Formatter<'_>, name: &str, v: u32) -> fmt::Result {
            if v == DeviceThread::ALL_INDICES {
                write!(f, "{} all", name)
            } else {
                write!(f, "{} {}", name, v)
            }
        }

        field(f, "slice", self.slice)?;
        f.write_str(" ")?;
        field(f, "subslice", self.subslice)?;
        f.write_str(" ")?;
        field(f, "eu", self.eu)?;
        f.write_str(" ")?;
        field(f, "thread", self.thread)
    }
}
