use super::{DeviceThread, ThreadId};

/// Upper bounds of the EU grid of a single tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Maximum number of slices per tile.
    pub slices: u32,
    /// Subslices in each slice.
    pub subslices_per_slice: u32,
    /// EUs in each subslice.
    pub eus_per_subslice: u32,
    /// Hardware threads in each EU.
    pub threads_per_eu: u32,
}

impl Geometry {
    /// Number of thread slots in one tile, enabled or not.
    pub fn threads_per_tile(&self) -> usize {
        self.slices as usize
            * self.subslices_per_slice as usize
            * self.eus_per_subslice as usize
            * self.threads_per_eu as usize
    }
}

/// Enabled slices and subslices of one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileTopology {
    /// Physical indices of the enabled slices, ascending.
    pub slices: Vec<u32>,
    /// Physical indices of the subslices enabled in every enabled slice,
    /// ascending.
    pub subslices: Vec<u32>,
}

/// Thread and tile topology of a device.
///
/// Provided once by the transport when a session attaches. Every thread the
/// topology enumerates gets a registry entry that lives as long as the
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Geometry shared by every tile.
    pub geometry: Geometry,
    /// Per-tile enabled units, indexed by tile.
    pub tiles: Vec<TileTopology>,
}

impl Topology {
    /// A topology where every slice and subslice of `tile_count` tiles is
    /// enabled.
    pub fn uniform(geometry: Geometry, tile_count: u32) -> Topology {
        let tile = TileTopology {
            slices: (0..geometry.slices).collect(),
            subslices: (0..geometry.subslices_per_slice).collect(),
        };
        Topology {
            geometry,
            tiles: vec![tile; tile_count as usize],
        }
    }

    /// Number of tiles.
    pub fn tile_count(&self) -> u32 {
        self.tiles.len() as u32
    }

    /// Every enabled thread of `tile`, in row-major order.
    pub fn tile_threads(&self, tile: u32) -> impl Iterator<Item = ThreadId> + '_ {
        let geometry = self.geometry;
        self.tiles
            .get(tile as usize)
            .into_iter()
            .flat_map(move |t| {
                t.slices.iter().flat_map(move |&slice| {
                    t.subslices.iter().flat_map(move |&subslice| {
                        (0..geometry.eus_per_subslice).flat_map(move |eu| {
                            (0..geometry.threads_per_eu)
                                .map(move |thread| ThreadId::new(tile, slice, subslice, eu, thread))
                        })
                    })
                })
            })
    }

    /// Resolve a logical API slice to `(tile, physical slice)`.
    ///
    /// With `scope` set, `api_slice` indexes the enabled slices of that tile
    /// only. Otherwise it indexes the enabled slices of every tile, tile 0
    /// first.
    pub fn resolve_slice(&self, scope: Option<u32>, api_slice: u32) -> Option<(u32, u32)> {
        if let Some(tile) = scope {
            let t = self.tiles.get(tile as usize)?;
            return t.slices.get(api_slice as usize).map(|s| (tile, *s));
        }

        let mut index = api_slice as usize;
        for (tile, t) in self.tiles.iter().enumerate() {
            if index < t.slices.len() {
                return Some((tile as u32, t.slices[index]));
            }
            index -= t.slices.len();
        }
        None
    }

    /// Inverse of [`Topology::resolve_slice`].
    pub fn api_slice(&self, scope: Option<u32>, tile: u32, slice: u32) -> Option<u32> {
        let t = self.tiles.get(tile as usize)?;
        let local = t.slices.iter().position(|s| *s == slice)? as u32;
        match scope {
            Some(_) => Some(local),
            None => {
                let before: usize = self.tiles[..tile as usize].iter().map(|t| t.slices.len()).sum();
                Some(before as u32 + local)
            }
        }
    }

    /// Convert a thread to its debugger-facing coordinate.
    pub fn to_device_thread(&self, scope: Option<u32>, id: &ThreadId) -> Option<DeviceThread> {
        let slice = self.api_slice(scope, id.tile, id.slice)?;
        Some(DeviceThread::new(slice, id.subslice, id.eu, id.thread))
    }

    /// Tiles selected by `thread` within `scope`.
    ///
    /// A wildcard slice selects every tile in scope. A concrete slice
    /// selects the tile it resolves to, or nothing when it is out of range.
    pub fn tiles_for(&self, scope: Option<u32>, thread: &DeviceThread) -> Vec<u32> {
        if thread.slice == DeviceThread::ALL_INDICES {
            match scope {
                Some(tile) => vec![tile],
                None => (0..self.tile_count()).collect(),
            }
        } else {
            self.resolve_slice(scope, thread.slice)
                .map(|(tile, _)| tile)
                .into_iter()
                .collect()
        }
    }
}
