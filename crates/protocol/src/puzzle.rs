//! The puzzle payload sent to the widget and the server-only ground truth
//! used to grade a solution. Modeled as a tagged sum, never a generic
//! dictionary — dynamic "bag of optional fields" shapes are exactly the bug
//! risk the source material mixes in.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Grid,
    Jigsaw,
    Gesture,
    UpsideDown,
    Audio,
}

impl ChallengeType {
    pub const ALL: [ChallengeType; 5] = [
        ChallengeType::Grid,
        ChallengeType::Jigsaw,
        ChallengeType::Gesture,
        ChallengeType::UpsideDown,
        ChallengeType::Audio,
    ];

    /// Variants considered "harder" in risk-based selection.
    pub fn is_hard(self) -> bool {
        matches!(self, ChallengeType::Gesture | ChallengeType::UpsideDown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpriteSpec {
    pub id: u32,
    pub position: Point,
    #[serde(rename = "rotationDeg")]
    pub rotation_deg: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneAnimal {
    pub name: String,
    pub position: Point,
}

/// The public puzzle payload, sent to the widget after encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "puzzleData", rename_all = "snake_case")]
pub enum Puzzle {
    Grid {
        #[serde(rename = "size")]
        size: u8,
        #[serde(rename = "gridEmojis")]
        grid_emojis: Vec<String>,
        #[serde(rename = "targetEmojis")]
        target_emojis: Vec<String>,
    },
    Jigsaw {
        #[serde(rename = "pieceColors")]
        piece_colors: [String; 4],
    },
    Gesture {
        #[serde(rename = "backgroundImage")]
        background_image: String,
        #[serde(rename = "cutSeed")]
        cut_seed: u64,
        width: f64,
        height: f64,
        tolerance: f64,
    },
    UpsideDown {
        sprites: Vec<SpriteSpec>,
        tolerance: f64,
    },
    Audio {
        scene: String,
        #[serde(rename = "sceneAnimals")]
        scene_animals: Vec<SceneAnimal>,
        #[serde(rename = "spokenNames")]
        spoken_names: Vec<String>,
    },
}

impl Puzzle {
    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            Puzzle::Grid { .. } => ChallengeType::Grid,
            Puzzle::Jigsaw { .. } => ChallengeType::Jigsaw,
            Puzzle::Gesture { .. } => ChallengeType::Gesture,
            Puzzle::UpsideDown { .. } => ChallengeType::UpsideDown,
            Puzzle::Audio { .. } => ChallengeType::Audio,
        }
    }
}

/// Server-only ground truth. Never serialized onto the wire to the client.
#[derive(Debug, Clone)]
pub enum Answer {
    Grid(Vec<usize>),
    Jigsaw([usize; 4]),
    Gesture { target: Point, tolerance: f64 },
    UpsideDown { targets: Vec<(u32, Point)>, tolerance: f64 },
    Audio { target_names: Vec<String>, scene_animals: Vec<SceneAnimal>, tolerance: f64 },
}

/// The client's submitted answer. Shape depends on the challenge type but
/// is self-describing enough for `serde(untagged)` to pick the right arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SolutionAnswer {
    Indices(Vec<usize>),
    Point(Point),
    Points(Vec<Point>),
}

impl Answer {
    pub fn matches(&self, submitted: &SolutionAnswer) -> bool {
        match (self, submitted) {
            (Answer::Grid(expected), SolutionAnswer::Indices(got)) => {
                let mut expected_sorted = expected.clone();
                let mut got_sorted = got.clone();
                expected_sorted.sort_unstable();
                got_sorted.sort_unstable();
                expected_sorted == got_sorted
            }
            (Answer::Jigsaw(expected), SolutionAnswer::Indices(got)) => {
                got.len() == 4 && expected.iter().copied().eq(got.iter().copied())
            }
            (Answer::Gesture { target, tolerance }, SolutionAnswer::Point(click)) => {
                click.distance(target) <= *tolerance
            }
            (Answer::UpsideDown { targets, tolerance }, SolutionAnswer::Points(clicks)) => {
                matches_one_to_one(
                    &targets.iter().map(|(_, p)| *p).collect::<Vec<_>>(),
                    clicks,
                    *tolerance,
                )
            }
            (
                Answer::Audio { target_names, scene_animals, tolerance },
                SolutionAnswer::Points(clicks),
            ) => {
                let target_positions: Vec<Point> = scene_animals
                    .iter()
                    .filter(|a| target_names.contains(&a.name))
                    .map(|a| a.position)
                    .collect();
                target_positions.len() == target_names.len()
                    && matches_one_to_one(&target_positions, clicks, *tolerance)
            }
            _ => false,
        }
    }
}

/// Greedy one-to-one matching: every target must be hit by exactly one
/// click within `tolerance`, and there must be no extra clicks.
fn matches_one_to_one(targets: &[Point], clicks: &[Point], tolerance: f64) -> bool {
    if targets.len() != clicks.len() {
        return false;
    }
    let mut used = vec![false; targets.len()];
    for click in clicks {
        let hit = targets
            .iter()
            .enumerate()
            .filter(|(i, _)| !used[*i])
            .find(|(_, target)| click.distance(target) <= tolerance);
        match hit {
            Some((i, _)) => used[i] = true,
            None => return false,
        }
    }
    used.iter().all(|&u| u)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_answer_ignores_order() {
        let answer = Answer::Grid(vec![0, 2, 4, 7]);
        assert!(answer.matches(&SolutionAnswer::Indices(vec![7, 4, 2, 0])));
        assert!(!answer.matches(&SolutionAnswer::Indices(vec![0, 2, 4])));
    }

    #[test]
    fn jigsaw_requires_exact_order() {
        let answer = Answer::Jigsaw([0, 1, 2, 3]);
        assert!(answer.matches(&SolutionAnswer::Indices(vec![0, 1, 2, 3])));
        assert!(!answer.matches(&SolutionAnswer::Indices(vec![1, 0, 2, 3])));
    }

    #[test]
    fn gesture_tolerance_boundary_is_inclusive() {
        let answer = Answer::Gesture { target: Point { x: 0.0, y: 0.0 }, tolerance: 10.0 };
        assert!(answer.matches(&SolutionAnswer::Point(Point { x: 10.0, y: 0.0 })));
        assert!(!answer.matches(&SolutionAnswer::Point(Point { x: 10.0001, y: 0.0 })));
    }

    #[test]
    fn upside_down_rejects_extra_clicks() {
        let answer = Answer::UpsideDown {
            targets: vec![(1, Point { x: 0.0, y: 0.0 })],
            tolerance: 20.0,
        };
        assert!(answer.matches(&SolutionAnswer::Points(vec![Point { x: 0.0, y: 0.0 }])));
        assert!(!answer.matches(&SolutionAnswer::Points(vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 5.0, y: 5.0 }
        ])));
    }

    #[test]
    fn audio_matches_named_targets_one_to_one() {
        let scene_animals = vec![
            SceneAnimal { name: "cat".into(), position: Point { x: 0.0, y: 0.0 } },
            SceneAnimal { name: "dog".into(), position: Point { x: 100.0, y: 0.0 } },
        ];
        let answer = Answer::Audio {
            target_names: vec!["cat".to_string()],
            scene_animals,
            tolerance: 5.0,
        };
        assert!(answer.matches(&SolutionAnswer::Points(vec![Point { x: 1.0, y: 1.0 }])));
        assert!(!answer.matches(&SolutionAnswer::Points(vec![Point { x: 100.0, y: 0.0 }])));
    }
}
