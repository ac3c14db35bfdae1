use crate::config::SceneGraphConfig;
use crate::types::{Detection, PerceptionResult, Relation, SceneEdge, SceneGraph, SceneNode};
use tracing::debug;

pub struct SceneGraphBuilder {
    config: SceneGraphConfig,
}

impl SceneGraphBuilder {
    pub fn new(config: SceneGraphConfig) -> Self {
        Self { config }
    }

    /// One node per detection in emission order; edges only within a camera frame.
    pub fn build(&self, perception: PerceptionResult) -> SceneGraph {
        let nodes: Vec<SceneNode> = perception
            .detections
            .iter()
            .cloned()
            .enumerate()
            .map(|(id, detection)| SceneNode { id, detection })
            .collect();

        let mut edges = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                if a.detection.camera_view != b.detection.camera_view {
                    continue;
                }
                edges.push(self.classify(a, b));
                edges.push(self.classify(b, a));
            }
        }

        debug!(nodes = nodes.len(), edges = edges.len(), "scene graph built");

        SceneGraph {
            nodes,
            edges,
            scene_description: perception.description.clone(),
            raw_perception: perception,
        }
    }

    /// Relation of `a` with respect to `b`.
    ///
    /// `in_front_of` means closer to the camera (and so to the ego vehicle).
    fn classify(&self, a: &SceneNode, b: &SceneNode) -> SceneEdge {
        let (relation, margin, confidence) = self.relation(&a.detection, &b.detection);
        SceneEdge {
            source: a.id,
            target: b.id,
            relation,
            margin,
            confidence: confidence as f32,
        }
    }

    fn relation(&self, a: &Detection, b: &Detection) -> (Relation, f64, f64) {
        let gap = (b.distance - a.distance).abs();
        if gap > self.config.distance_gap {
            let confidence = (gap / (2.0 * self.config.distance_gap)).clamp(0.0, 1.0);
            return (Relation::Far, gap, confidence);
        }

        let dx = b.pixel_center.x - a.pixel_center.x;
        let dy = b.pixel_center.y - a.pixel_center.y;
        let (adx, ady) = (dx.abs(), dy.abs());
        let min_margin = self.config.min_pixel_margin;

        if adx <= min_margin && ady <= min_margin {
            let margin = adx.max(ady);
            let confidence = if min_margin > 0.0 {
                (1.0 - margin / min_margin).clamp(0.0, 1.0)
            } else {
                1.0
            };
            return (Relation::Near, margin, confidence);
        }

        if adx >= ady {
            let relation = if dx > 0.0 {
                Relation::LeftOf
            } else {
                Relation::RightOf
            };
            (relation, adx, (adx - ady) / adx)
        } else {
            let a_nearer = if (a.distance - b.distance).abs() > f64::EPSILON {
                a.distance < b.distance
            } else {
                dy < 0.0
            };
            let relation = if a_nearer {
                Relation::InFrontOf
            } else {
                Relation::Behind
            };
            (relation, ady, (ady - adx) / ady)
        }
    }
}
