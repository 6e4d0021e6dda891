//! Two-level index space: a rows x cols grid cut into workgroup tiles.

use tilebench_types::DeviceSpec;

use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Grid {
    rows: usize,
    cols: usize,
}

impl Grid {
    pub fn new(rows: usize, cols: usize) -> Result<Self, Error> {
        if rows == 0 || cols == 0 {
            return Err(Error::InvalidConfig(format!(
                "grid {}x{} has an empty dimension",
                rows, cols
            )));
        }
        if rows.checked_mul(cols).is_none() {
            return Err(Error::InvalidConfig(format!(
                "grid {}x{} overflows the index space",
                rows, cols
            )));
        }
        Ok(Self { rows, cols })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Row-major offset of `(i, j)`.
    #[inline]
    pub fn offset(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < self.rows && j < self.cols);
        i * self.cols + j
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TileShape {
    rows: usize,
    cols: usize,
}

impl TileShape {
    pub fn new(rows: usize, cols: usize) -> Result<Self, Error> {
        if rows == 0 || cols == 0 {
            return Err(Error::InvalidConfig(format!(
                "tile {}x{} has an empty dimension",
                rows, cols
            )));
        }
        Ok(Self { rows, cols })
    }

    /// Tile of `tile_rows` rows whose width fills a fixed workgroup capacity.
    pub fn with_capacity(tile_rows: usize, capacity: usize) -> Result<Self, Error> {
        if tile_rows == 0 || capacity % tile_rows != 0 {
            return Err(Error::InvalidConfig(format!(
                "tile rows {} do not divide workgroup capacity {}",
                tile_rows, capacity
            )));
        }
        Self::new(tile_rows, capacity / tile_rows)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A grid and tile shape checked against the limits of one device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    grid: Grid,
    tile: TileShape,
    groups_rows: usize,
    groups_cols: usize,
}

impl LaunchConfig {
    pub fn new(grid: Grid, tile: TileShape, spec: &DeviceSpec) -> Result<Self, Error> {
        let requested = tile.rows.checked_mul(tile.cols).unwrap_or(usize::MAX);
        if requested > spec.max_workgroup_size {
            return Err(Error::CapacityExceeded {
                resource: "workgroup size",
                requested,
                limit: spec.max_workgroup_size,
            });
        }
        Ok(Self {
            grid,
            tile,
            groups_rows: grid.rows.div_ceil(tile.rows),
            groups_cols: grid.cols.div_ceil(tile.cols),
        })
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn tile(&self) -> TileShape {
        self.tile
    }

    /// Workgroups along (rows, cols).
    pub fn group_dims(&self) -> (usize, usize) {
        (self.groups_rows, self.groups_cols)
    }

    pub fn num_groups(&self) -> usize {
        self.groups_rows * self.groups_cols
    }

    pub fn group(&self, linear: usize) -> Workgroup {
        debug_assert!(linear < self.num_groups());
        Workgroup {
            config: *self,
            gi: linear / self.groups_cols,
            gj: linear % self.groups_cols,
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = Workgroup> + '_ {
        (0..self.num_groups()).map(move |g| self.group(g))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Workgroup {
    config: LaunchConfig,
    gi: usize,
    gj: usize,
}

impl Workgroup {
    pub fn id(&self) -> (usize, usize) {
        (self.gi, self.gj)
    }

    pub fn linear_id(&self) -> usize {
        self.gi * self.config.groups_cols + self.gj
    }

    /// Members of the group, including those clipped off the grid edge.
    pub fn size(&self) -> usize {
        self.config.tile.len()
    }

    pub fn item(&self, local_linear: usize) -> WorkItem {
        let tile = self.config.tile;
        let li = local_linear / tile.cols;
        let lj = local_linear % tile.cols;
        let i = self.gi * tile.rows + li;
        let j = self.gj * tile.cols + lj;
        WorkItem {
            global: (i, j),
            local: (li, lj),
            group: (self.gi, self.gj),
            local_linear,
            in_bounds: i < self.config.grid.rows && j < self.config.grid.cols,
        }
    }

    pub fn items(&self) -> impl Iterator<Item = WorkItem> + '_ {
        (0..self.size()).map(move |l| self.item(l))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    global: (usize, usize),
    local: (usize, usize),
    group: (usize, usize),
    local_linear: usize,
    in_bounds: bool,
}

impl WorkItem {
    #[inline]
    pub fn global_id(&self) -> (usize, usize) {
        self.global
    }

    #[inline]
    pub fn local_id(&self) -> (usize, usize) {
        self.local
    }

    #[inline]
    pub fn group_id(&self) -> (usize, usize) {
        self.group
    }

    #[inline]
    pub fn local_linear_id(&self) -> usize {
        self.local_linear
    }

    /// False for members of a clipped edge tile that fall outside the grid.
    #[inline]
    pub fn in_bounds(&self) -> bool {
        self.in_bounds
    }
}
