mod forces;
mod quadtree;

use std::collections::HashMap;
use std::f32::consts::TAU;

use emath::{Vec2, vec2};
use serde::Serialize;
use tracing::trace;

use crate::graph::GraphPayload;
use crate::util::stable_pair;

use forces::{accumulate_pairwise_repulsion, accumulate_springs};
use quadtree::MassTree;

const BARNES_HUT_THETA: f32 = 0.72;

#[derive(Clone, Debug)]
pub struct LayoutConfig {
    pub base_iterations: usize,
    pub iterations_per_node: f32,
    pub max_iterations: usize,
    pub repulsion: f32,
    pub softening: f32,
    pub spring_stiffness: f32,
    pub link_length: f32,
    pub center_pull: f32,
    /// Velocity multiplier applied after every step.
    pub damping: f32,
    pub max_speed: f32,
    /// Relaxation stops early once no body moves faster than this.
    pub rest_speed: f32,
    /// Above this many nodes repulsion uses the Barnes–Hut approximation. A
    /// window update adds up to three nodes, so the default window crosses it.
    pub barnes_hut_threshold: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            base_iterations: 60,
            iterations_per_node: 1.5,
            max_iterations: 300,
            repulsion: 9_000.0,
            softening: 25.0,
            spring_stiffness: 0.04,
            link_length: 60.0,
            center_pull: 0.002,
            damping: 0.9,
            max_speed: 30.0,
            rest_speed: 0.02,
            barnes_hut_threshold: 96,
        }
    }
}

impl LayoutConfig {
    pub fn iteration_budget(&self, node_count: usize) -> usize {
        if node_count < 2 {
            return 0;
        }
        let scaled = self.base_iterations as f32 + self.iterations_per_node * node_count as f32;
        (scaled as usize).min(self.max_iterations)
    }

    fn approximates(&self, node_count: usize) -> bool {
        node_count > self.barnes_hut_threshold
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodePosition {
    pub id: String,
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutFrame {
    pub positions: Vec<NodePosition>,
    /// Left unset by the engine; the pipeline raises it on the first frame it
    /// publishes after a reset.
    pub fit_viewport: bool,
    pub iterations: usize,
}

#[derive(Clone, Copy, Debug)]
struct Body {
    position: Vec2,
    velocity: Vec2,
}

/// Force-directed layout with positions that persist across graph rebuilds,
/// keyed by node id.
pub struct LayoutEngine {
    config: LayoutConfig,
    bodies: HashMap<String, Body>,
}

impl LayoutEngine {
    pub fn new(config: LayoutConfig) -> Self {
        Self {
            config,
            bodies: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.bodies.clear();
    }

    pub fn layout(&mut self, graph: &GraphPayload) -> LayoutFrame {
        let node_count = graph.nodes.len();
        if node_count == 0 {
            self.bodies.clear();
            return LayoutFrame::default();
        }

        let index_by_id = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.id.as_str(), index))
            .collect::<HashMap<_, _>>();
        let mut edges = graph
            .links
            .iter()
            .filter_map(|link| {
                let source = *index_by_id.get(link.source.as_str())?;
                let target = *index_by_id.get(link.target.as_str())?;
                (source != target).then_some((source.min(target), source.max(target)))
            })
            .collect::<Vec<_>>();
        // announce and withdraw links between the same pair pull once
        edges.sort_unstable();
        edges.dedup();

        let (mut positions, mut velocities) = self.seed_bodies(graph, &edges);

        let budget = self.config.iteration_budget(node_count);
        let mut iterations = 0;
        while iterations < budget {
            iterations += 1;
            let fastest = self.step(&mut positions, &mut velocities, &edges);
            if fastest < self.config.rest_speed {
                break;
            }
        }
        trace!(nodes = node_count, edges = edges.len(), iterations, "layout relaxed");

        let mut bodies = HashMap::with_capacity(node_count);
        let mut frame_positions = Vec::with_capacity(node_count);
        for ((node, position), velocity) in graph.nodes.iter().zip(positions).zip(velocities) {
            bodies.insert(node.id.clone(), Body { position, velocity });
            frame_positions.push(NodePosition {
                id: node.id.clone(),
                x: position.x,
                y: position.y,
            });
        }
        self.bodies = bodies;

        LayoutFrame {
            positions: frame_positions,
            fit_viewport: false,
            iterations,
        }
    }

    /// Known nodes keep their last position. On a first load, nodes are spread
    /// evenly around a circle; later arrivals start next to a placed neighbour.
    fn seed_bodies(&self, graph: &GraphPayload, edges: &[(usize, usize)]) -> (Vec<Vec2>, Vec<Vec2>) {
        let node_count = graph.nodes.len();
        let first_load = self.bodies.is_empty();
        let spread = self.config.link_length * (node_count as f32).sqrt();

        let mut positions = Vec::with_capacity(node_count);
        let mut velocities = Vec::with_capacity(node_count);
        let mut placed = vec![false; node_count];
        for (index, node) in graph.nodes.iter().enumerate() {
            if let Some(body) = self.bodies.get(&node.id) {
                positions.push(body.position);
                velocities.push(body.velocity);
                placed[index] = true;
            } else if first_load {
                let angle = (index as f32 / node_count as f32) * TAU;
                positions.push(vec2(angle.cos(), angle.sin()) * spread * 0.5);
                velocities.push(Vec2::ZERO);
                placed[index] = true;
            } else {
                positions.push(Vec2::ZERO);
                velocities.push(Vec2::ZERO);
            }
        }

        if first_load {
            return (positions, velocities);
        }

        for (index, node) in graph.nodes.iter().enumerate() {
            if placed[index] {
                continue;
            }

            let (jx, jy) = stable_pair(&node.id);
            let jitter = vec2(jx, jy);
            let neighbour = edges.iter().find_map(|&(a, b)| match (a == index, b == index) {
                (true, _) if placed[b] => Some(b),
                (_, true) if placed[a] => Some(a),
                _ => None,
            });

            positions[index] = match neighbour {
                Some(other) => positions[other] + jitter * self.config.link_length,
                None => jitter * spread,
            };
            placed[index] = true;
        }

        (positions, velocities)
    }

    fn step(&self, positions: &mut [Vec2], velocities: &mut [Vec2], edges: &[(usize, usize)]) -> f32 {
        let config = &self.config;
        let mut forces = vec![Vec2::ZERO; positions.len()];

        if config.approximates(positions.len()) {
            if let Some(tree) = MassTree::build(positions) {
                for (index, force) in forces.iter_mut().enumerate() {
                    *force += tree.repulsion_on(
                        index,
                        positions,
                        config.repulsion,
                        config.softening,
                        BARNES_HUT_THETA,
                    );
                }
            }
        } else {
            accumulate_pairwise_repulsion(positions, config.repulsion, config.softening, &mut forces);
        }

        accumulate_springs(positions, edges, config.spring_stiffness, config.link_length, &mut forces);

        let mut fastest = 0.0_f32;
        for ((position, velocity), force) in positions.iter_mut().zip(velocities.iter_mut()).zip(forces) {
            let force = force - *position * config.center_pull;
            let mut next = (*velocity + force) * config.damping;
            let speed = next.length();
            if speed > config.max_speed {
                next *= config.max_speed / speed;
            }
            if !next.is_finite() {
                next = Vec2::ZERO;
            }

            *velocity = next;
            *position += next;
            fastest = fastest.max(next.length());
        }
        fastest
    }
}
