//! The plot type and the pure functions that decide placement.

use crate::types::outpoint_string;
use crate::CANVAS_SIZE;
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

/// Lifecycle of a plot.
///
/// PLACED plots occupy their rectangle. UNPLACED plots exist (their deed is
/// live) but their rectangle is unavailable; a RETRY-CLAIM can rescue them.
/// BRICKED is terminal: the deed chain was broken. A plot that was PLACED at
/// the moment of bricking reserves its rectangle forever.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PlotStatus {
    #[serde(rename = "PLACED")]
    Placed,
    #[serde(rename = "UNPLACED")]
    Unplaced,
    #[serde(rename = "BRICKED")]
    Bricked,
}

/// A half-open rectangle `[x0, x0+w) × [y0, y0+h)` on the canvas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Rect {
    pub x0: u16,
    pub y0: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x0: u16, y0: u16, width: u16, height: u16) -> Self {
        Self {
            x0,
            y0,
            width,
            height,
        }
    }

    fn x1(&self) -> u32 {
        u32::from(self.x0) + u32::from(self.width)
    }

    fn y1(&self) -> u32 {
        u32::from(self.y0) + u32::from(self.height)
    }

    /// Strict overlap; touching edges do not overlap.
    pub fn overlaps(&self, other: &Rect) -> bool {
        u32::from(self.x0) < other.x1()
            && self.x1() > u32::from(other.x0)
            && u32::from(self.y0) < other.y1()
            && self.y1() > u32::from(other.y0)
    }

    /// Whether the rectangle is non-degenerate and lies fully on the canvas.
    pub fn fits_canvas(&self) -> bool {
        self.width > 0 && self.height > 0 && self.x1() <= CANVAS_SIZE && self.y1() <= CANVAS_SIZE
    }
}

/// A claimed plot. The `txid` of the CLAIM transaction is its identity for
/// its entire life; width and height are fixed at claim time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plot {
    pub txid: Txid,
    pub x0: u16,
    pub y0: u16,
    pub width: u16,
    pub height: u16,
    pub status: PlotStatus,
    /// The outpoint currently controlling the plot.
    #[serde(with = "outpoint_string")]
    pub deed_utxo: OutPoint,
    /// Hex SHA-256 of the latest accepted BMP.
    pub image_hash: String,
    /// Address of the current deed output; empty once bricked.
    pub owner: String,
    pub uri: Option<String>,
    /// Only meaningful when bricked: whether the plot occupied space when its
    /// deed chain broke.
    pub was_placed_before_bricking: bool,
    pub created_at: u32,
    pub last_updated: u32,
}

impl Plot {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x0, self.y0, self.width, self.height)
    }

    /// Whether this plot blocks other plots from being placed over it.
    /// UNPLACED plots and plots bricked while UNPLACED take no space.
    pub fn occupies_space(&self) -> bool {
        match self.status {
            PlotStatus::Placed => true,
            PlotStatus::Unplaced => false,
            PlotStatus::Bricked => self.was_placed_before_bricking,
        }
    }

    /// Marks the plot's deed chain as broken. Everything except the status,
    /// owner and placement memory is preserved.
    pub fn brick(&mut self) {
        self.was_placed_before_bricking = self.status == PlotStatus::Placed;
        self.status = PlotStatus::Bricked;
        self.owner.clear();
    }
}

/// Decides the status a rectangle would take against the given plots: out of
/// bounds or colliding with occupied space means UNPLACED.
pub fn determine_status<'a>(
    rect: Rect,
    plots: impl IntoIterator<Item = &'a Plot>,
) -> PlotStatus {
    if !rect.fits_canvas() {
        return PlotStatus::Unplaced;
    }
    for plot in plots {
        if plot.occupies_space() && rect.overlaps(&plot.rect()) {
            return PlotStatus::Unplaced;
        }
    }
    PlotStatus::Placed
}
