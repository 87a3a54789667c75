//! Moderator fog brush.

use crate::connection::EventSink;
use crate::reconciler::Reconciler;
use shared::{brush_cells, CellKey, MAX_BRUSH_RADIUS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrushMode {
    #[default]
    Reveal,
    Erase,
}

/// Turns pointer samples into brush stamps.
///
/// Within one stroke, a stamp centred on the same cell as the previous one
/// covers nothing new and is skipped.
#[derive(Debug, Clone)]
pub struct FogPainter {
    radius: u32,
    mode: BrushMode,
    last_center: Option<CellKey>,
}

impl FogPainter {
    /// Brush of `radius` cells, capped at [`MAX_BRUSH_RADIUS`].
    pub fn new(radius: u32) -> Self {
        Self {
            radius: radius.min(MAX_BRUSH_RADIUS),
            mode: BrushMode::Reveal,
            last_center: None,
        }
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }

    pub fn set_radius(&mut self, radius: u32) {
        self.radius = radius.min(MAX_BRUSH_RADIUS);
    }

    pub fn mode(&self) -> BrushMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: BrushMode) {
        self.mode = mode;
    }

    pub fn begin_stroke(&mut self) {
        self.last_center = None;
    }

    pub fn end_stroke(&mut self) {
        self.last_center = None;
    }

    /// Cells for a stamp at map point `(x, y)`, or `None` when the stamp is
    /// skipped.
    pub fn stamp(&mut self, x: f64, y: f64, grid_size: u32) -> Option<Vec<CellKey>> {
        let center = CellKey::containing(x, y, grid_size);
        if self.last_center == Some(center) {
            return None;
        }
        self.last_center = Some(center);

        let cells = brush_cells(center, self.radius);
        if cells.is_empty() {
            None
        } else {
            Some(cells)
        }
    }

    /// Stamps at `(x, y)` and hands the cells to `reconciler`. Returns
    /// whether anything was painted.
    pub fn paint<S: EventSink>(&mut self, reconciler: &Reconciler<S>, x: f64, y: f64) -> bool {
        let Some(config) = reconciler.config() else {
            return false;
        };
        match self.stamp(x, y, config.grid_size) {
            Some(cells) => reconciler.paint_fog(cells, self.mode == BrushMode::Erase),
            None => false,
        }
    }
}

impl Default for FogPainter {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shared::{ClientEvent, Role, Room, ServerEvent};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<ClientEvent>>,
    }

    impl EventSink for RecordingSink {
        fn send(&self, event: ClientEvent) -> bool {
            self.sent.lock().push(event);
            true
        }
    }

    fn moderator_view() -> (Reconciler<RecordingSink>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let reconciler = Reconciler::new(Arc::clone(&sink));
        reconciler.handle(&ServerEvent::StateSync {
            room: Room::new("crypt", "gm"),
            role: Role::Moderator,
            user_id: "gm".to_string(),
        });
        (reconciler, sink)
    }

    #[test]
    fn test_same_cell_skipped_within_stroke() {
        let mut painter = FogPainter::new(1);
        painter.begin_stroke();
        assert_eq!(painter.stamp(10.0, 10.0, 50), Some(vec![CellKey::new(0, 0)]));
        assert_eq!(painter.stamp(40.0, 49.0, 50), None);
        assert_eq!(painter.stamp(60.0, 10.0, 50), Some(vec![CellKey::new(1, 0)]));
        painter.end_stroke();

        painter.begin_stroke();
        assert!(painter.stamp(60.0, 10.0, 50).is_some());
    }

    #[test]
    fn test_negative_coordinates() {
        let mut painter = FogPainter::new(1);
        assert_eq!(painter.stamp(-1.0, -51.0, 50), Some(vec![CellKey::new(-1, -2)]));
    }

    #[test]
    fn test_radius_capped_and_far_stamp_is_safe() {
        let mut painter = FogPainter::new(u32::MAX);
        assert_eq!(painter.radius(), MAX_BRUSH_RADIUS);

        painter.set_radius(2);
        let cells = painter.stamp(1e12, 0.0, 50).unwrap();
        assert!(cells.iter().all(|c| c.col == i32::MAX || c.col == i32::MAX - 1));
    }

    #[test]
    fn test_zero_radius_paints_nothing() {
        let mut painter = FogPainter::new(0);
        assert_eq!(painter.stamp(0.0, 0.0, 50), None);
    }

    #[tokio::test]
    async fn test_each_stamp_sent_separately() {
        let (reconciler, sink) = moderator_view();
        let mut painter = FogPainter::new(2);

        painter.begin_stroke();
        assert!(painter.paint(&reconciler, 75.0, 75.0));
        assert!(painter.paint(&reconciler, 175.0, 75.0));
        painter.end_stroke();

        let sent = sink.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        for event in &sent {
            match event {
                ClientEvent::RevealFog { cells, erase } => {
                    assert_eq!(cells.len(), 9);
                    assert!(!erase);
                }
                other => panic!("Unexpected event: {:?}", other),
            }
        }

        let fog = reconciler.snapshot().unwrap().fog_state;
        assert!(fog.is_revealed(CellKey::new(1, 1)));
        assert!(fog.is_revealed(CellKey::new(3, 1)));
        assert_eq!(fog.len(), 15);
    }

    #[tokio::test]
    async fn test_erase_mode() {
        let (reconciler, sink) = moderator_view();
        let mut painter = FogPainter::new(1);

        painter.paint(&reconciler, 0.0, 0.0);
        painter.set_mode(BrushMode::Erase);
        painter.begin_stroke();
        painter.paint(&reconciler, 0.0, 0.0);

        assert!(reconciler.snapshot().unwrap().fog_state.is_empty());
        assert!(matches!(
            sink.sent.lock().last(),
            Some(ClientEvent::RevealFog { erase: true, .. })
        ));
    }
}
