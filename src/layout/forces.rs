use emath::{Vec2, vec2};

/// Inverse-square push of `point_a` away from `point_b`. `softening` keeps the
/// force finite when the two points coincide.
pub(super) fn repulsion_between(point_a: Vec2, point_b: Vec2, strength: f32, softening: f32) -> Vec2 {
    let delta = point_a - point_b;
    let distance_sq = delta.length_sq();
    let distance = distance_sq.sqrt();
    let direction = if distance > 0.0001 {
        delta / distance
    } else {
        vec2(1.0, 0.0)
    };
    direction * (strength / (distance_sq + softening))
}

pub(super) fn accumulate_pairwise_repulsion(
    positions: &[Vec2],
    strength: f32,
    softening: f32,
    forces: &mut [Vec2],
) {
    for i in 0..positions.len() {
        for j in (i + 1)..positions.len() {
            let mut push = repulsion_between(positions[i], positions[j], strength, softening);
            if positions[i] == positions[j] {
                // split coincident bodies in a direction that depends on the pair
                let angle = ((i as f32) * 0.618_034 + (j as f32) * 0.414_214) * std::f32::consts::TAU;
                push = vec2(angle.cos(), angle.sin()) * push.length();
            }
            forces[i] += push;
            forces[j] -= push;
        }
    }
}

/// Hooke spring along every link, pulling towards `rest_length`.
pub(super) fn accumulate_springs(
    positions: &[Vec2],
    edges: &[(usize, usize)],
    stiffness: f32,
    rest_length: f32,
    forces: &mut [Vec2],
) {
    for &(from, to) in edges {
        if from == to {
            continue;
        }

        let delta = positions[from] - positions[to];
        let distance = delta.length();
        if distance <= 0.0001 {
            continue;
        }

        let correction = (delta / distance) * ((distance - rest_length) * stiffness);
        forces[from] -= correction;
        forces[to] += correction;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repulsion_falls_off_with_squared_distance() {
        let near = repulsion_between(vec2(10.0, 0.0), Vec2::ZERO, 1000.0, 0.0);
        let far = repulsion_between(vec2(20.0, 0.0), Vec2::ZERO, 1000.0, 0.0);
        assert!(near.x > 0.0);
        assert!((near.x / far.x - 4.0).abs() < 1e-4);
    }

    #[test]
    fn coincident_points_stay_finite() {
        let push = repulsion_between(Vec2::ZERO, Vec2::ZERO, 1000.0, 1.0);
        assert!(push.is_finite());

        let positions = [Vec2::ZERO, Vec2::ZERO];
        let mut forces = [Vec2::ZERO; 2];
        accumulate_pairwise_repulsion(&positions, 1000.0, 1.0, &mut forces);
        assert!(forces[0].length() > 0.0);
        assert_eq!(forces[0], -forces[1]);
    }

    #[test]
    fn springs_pull_stretched_links_together() {
        let positions = [Vec2::ZERO, vec2(100.0, 0.0)];
        let mut forces = [Vec2::ZERO; 2];
        accumulate_springs(&positions, &[(0, 1)], 0.1, 40.0, &mut forces);
        assert!(forces[0].x > 0.0);
        assert!(forces[1].x < 0.0);
    }
}
