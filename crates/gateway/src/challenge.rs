//! Challenge factory (C4): builds the public puzzle payload plus the
//! server-only `Answer` ground truth for every variant in §4.4, and attaches
//! a proof-of-work challenge scaled to the policy's configured difficulty.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use rand::Rng;

use captcha_protocol::pow;
use captcha_protocol::puzzle::{Answer, ChallengeType, Point, Puzzle, SceneAnimal, SpriteSpec};

use crate::models::{ChallengeSelectionMode, PolicyRecord, RiskBand};

const EMOJI_POOL: &[&str] =
    &["🍎", "🍊", "🍌", "🍇", "🍋", "🍉", "🍓", "🥝", "🍍", "🍒", "🥑", "🍑"];
const JIGSAW_COLORS: [&str; 4] = ["red", "blue", "green", "yellow"];
const BACKGROUND_IMAGES: &[&str] = &["beach", "mountain", "city", "forest"];
const ANIMAL_NAMES: &[&str] = &["cat", "dog", "fox", "owl", "bear", "frog"];

pub struct ChallengeFactory {
    sequential_cursor: AtomicUsize,
}

impl Default for ChallengeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeFactory {
    pub fn new() -> Self {
        Self { sequential_cursor: AtomicUsize::new(0) }
    }

    /// Picks a challenge type per §4.4's selection rules. `requested`
    /// (the widget's `preferredChallengeType`-equivalent request field)
    /// wins outright if enabled; otherwise the policy's own
    /// `preferredChallengeType` wins; otherwise `challengeSelectionMode`
    /// decides among the enabled set.
    pub fn select_type(
        &self,
        policy: &PolicyRecord,
        requested: Option<ChallengeType>,
        risk_band: Option<RiskBand>,
    ) -> ChallengeType {
        let enabled = &policy.enabled_challenge_types;
        if let Some(t) = requested {
            if enabled.contains(&t) {
                return t;
            }
        }
        if let Some(t) = policy.preferred_challenge_type {
            if enabled.contains(&t) {
                return t;
            }
        }

        match policy.challenge_selection_mode {
            ChallengeSelectionMode::Sequential => {
                let idx = self.sequential_cursor.fetch_add(1, Ordering::Relaxed) % enabled.len().max(1);
                enabled.get(idx).copied().unwrap_or(ChallengeType::Grid)
            }
            ChallengeSelectionMode::RiskBased => {
                let prefer_hard = matches!(risk_band, Some(RiskBand::High) | Some(RiskBand::Critical));
                let pool: Vec<ChallengeType> = enabled
                    .iter()
                    .copied()
                    .filter(|t| t.is_hard() == prefer_hard)
                    .collect();
                let pool = if pool.is_empty() { enabled.clone() } else { pool };
                *pool.choose(&mut rand::thread_rng()).unwrap_or(&ChallengeType::Grid)
            }
            ChallengeSelectionMode::Random => {
                *enabled.choose(&mut rand::thread_rng()).unwrap_or(&ChallengeType::Grid)
            }
        }
    }

    /// Builds the puzzle payload and its ground-truth answer for `kind`.
    pub fn build(&self, kind: ChallengeType) -> (Puzzle, Answer) {
        match kind {
            ChallengeType::Grid => build_grid(),
            ChallengeType::Jigsaw => build_jigsaw(),
            ChallengeType::Gesture => build_gesture(),
            ChallengeType::UpsideDown => build_upside_down(),
            ChallengeType::Audio => build_audio(),
        }
    }

    pub fn build_pow(&self, policy: &PolicyRecord) -> pow::PowParams {
        pow::generate(policy.proof_of_work_difficulty)
    }
}

fn build_grid() -> (Puzzle, Answer) {
    let mut rng = rand::thread_rng();
    let size: u8 = *[3u8, 4u8].choose(&mut rng).unwrap();
    let cells = (size as usize) * (size as usize);

    let num_targets = rng.gen_range(1..=5usize.min(EMOJI_POOL.len()));
    let mut pool = EMOJI_POOL.to_vec();
    pool.shuffle(&mut rng);
    let target_emojis: Vec<&str> = pool[..num_targets].to_vec();
    let distractor_emojis: Vec<&str> = pool[num_targets..].to_vec();

    let mut grid_emojis = Vec::with_capacity(cells);
    for _ in 0..cells {
        let use_target = rng.gen_bool(0.35);
        let emoji = if use_target || distractor_emojis.is_empty() {
            *target_emojis.choose(&mut rng).unwrap()
        } else {
            *distractor_emojis.choose(&mut rng).unwrap()
        };
        grid_emojis.push(emoji.to_string());
    }

    // Guarantee at least one target cell exists so the puzzle is solvable.
    if !grid_emojis.iter().any(|e| target_emojis.contains(&e.as_str())) {
        let idx = rng.gen_range(0..cells);
        grid_emojis[idx] = target_emojis[0].to_string();
    }

    let answer: Vec<usize> = grid_emojis
        .iter()
        .enumerate()
        .filter(|(_, e)| target_emojis.contains(&e.as_str()))
        .map(|(i, _)| i)
        .collect();

    let puzzle = Puzzle::Grid {
        size,
        grid_emojis,
        target_emojis: target_emojis.into_iter().map(String::from).collect(),
    };
    (puzzle, Answer::Grid(answer))
}

fn build_jigsaw() -> (Puzzle, Answer) {
    let mut rng = rand::thread_rng();
    let mut piece_colors = JIGSAW_COLORS;
    piece_colors.shuffle(&mut rng);

    // Canonical solve order is red -> blue -> green -> yellow; the answer is
    // the sequence of *displayed* indices that realizes that order.
    let answer: [usize; 4] = std::array::from_fn(|i| {
        piece_colors.iter().position(|&c| c == JIGSAW_COLORS[i]).expect("colors are a permutation")
    });

    (
        Puzzle::Jigsaw { piece_colors: piece_colors.map(|c| c.to_string()) },
        Answer::Jigsaw(answer),
    )
}

fn build_gesture() -> (Puzzle, Answer) {
    let mut rng = rand::thread_rng();
    let width = 320.0;
    let height = 240.0;
    let tolerance = rng.gen_range(8.0..=20.0);
    let target = Point { x: rng.gen_range(0.0..width), y: rng.gen_range(0.0..height) };

    let puzzle = Puzzle::Gesture {
        background_image: (*BACKGROUND_IMAGES.choose(&mut rng).unwrap()).to_string(),
        cut_seed: rng.gen(),
        width,
        height,
        tolerance,
    };
    (puzzle, Answer::Gesture { target, tolerance })
}

fn build_upside_down() -> (Puzzle, Answer) {
    let mut rng = rand::thread_rng();
    let count = rng.gen_range(3..=6u32);
    let tolerance = 20.0;

    let mut sprites = Vec::with_capacity(count as usize);
    let mut targets = Vec::new();
    for id in 0..count {
        let rotation_deg = *[0u16, 180u16].choose(&mut rng).unwrap();
        let position = Point { x: rng.gen_range(0.0..320.0), y: rng.gen_range(0.0..240.0) };
        sprites.push(SpriteSpec { id, position, rotation_deg });
        if rotation_deg != 0 {
            targets.push((id, position));
        }
    }

    (Puzzle::UpsideDown { sprites, tolerance }, Answer::UpsideDown { targets, tolerance })
}

fn build_audio() -> (Puzzle, Answer) {
    let mut rng = rand::thread_rng();
    let mut names = ANIMAL_NAMES.to_vec();
    names.shuffle(&mut rng);
    let scene_count = rng.gen_range(3..=names.len());
    let scene_names = &names[..scene_count];

    let scene_animals: Vec<SceneAnimal> = scene_names
        .iter()
        .map(|name| SceneAnimal {
            name: name.to_string(),
            position: Point { x: rng.gen_range(0.0..320.0), y: rng.gen_range(0.0..240.0) },
        })
        .collect();

    let target_count = rng.gen_range(1..=scene_animals.len());
    let mut target_names: Vec<String> =
        scene_animals.iter().take(target_count).map(|a| a.name.clone()).collect();
    target_names.shuffle(&mut rng);

    let tolerance = 30.0;
    let puzzle = Puzzle::Audio {
        scene: "farmyard".to_string(),
        scene_animals: scene_animals.clone(),
        spoken_names: target_names.clone(),
    };
    (puzzle, Answer::Audio { target_names, scene_animals, tolerance })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_answer_indices_point_at_target_emojis() {
        let (puzzle, answer) = build_grid();
        let Puzzle::Grid { grid_emojis, target_emojis, .. } = &puzzle else { panic!("expected grid") };
        let Answer::Grid(indices) = &answer else { panic!("expected grid answer") };
        assert!(!indices.is_empty());
        assert!(!target_emojis.is_empty());
        for &i in indices {
            assert!(i < grid_emojis.len());
            assert!(target_emojis.contains(&grid_emojis[i]));
        }
    }

    #[test]
    fn jigsaw_answer_reorders_to_canonical_color_sequence() {
        let (puzzle, answer) = build_jigsaw();
        let Puzzle::Jigsaw { piece_colors } = &puzzle else { panic!("expected jigsaw") };
        let Answer::Jigsaw(order) = &answer else { panic!("expected jigsaw answer") };
        let reordered: Vec<&str> = order.iter().map(|&i| piece_colors[i].as_str()).collect();
        assert_eq!(reordered, JIGSAW_COLORS.to_vec());
    }

    #[test]
    fn upside_down_targets_are_the_rotated_sprites() {
        let (puzzle, answer) = build_upside_down();
        let Puzzle::UpsideDown { sprites, .. } = &puzzle else { panic!("expected upside_down") };
        let Answer::UpsideDown { targets, .. } = &answer else { panic!("expected upside_down answer") };
        let rotated: Vec<u32> = sprites.iter().filter(|s| s.rotation_deg != 0).map(|s| s.id).collect();
        let target_ids: Vec<u32> = targets.iter().map(|(id, _)| *id).collect();
        assert_eq!(rotated, target_ids);
    }

    #[test]
    fn select_type_honors_an_enabled_explicit_request() {
        let factory = ChallengeFactory::new();
        let policy = PolicyRecord::default();
        let picked = factory.select_type(&policy, Some(ChallengeType::Audio), None);
        assert_eq!(picked, ChallengeType::Audio);
    }

    #[test]
    fn sequential_mode_advances_through_the_enabled_set() {
        let factory = ChallengeFactory::new();
        let mut policy = PolicyRecord::default();
        policy.challenge_selection_mode = ChallengeSelectionMode::Sequential;
        policy.enabled_challenge_types = vec![ChallengeType::Grid, ChallengeType::Jigsaw];

        let first = factory.select_type(&policy, None, None);
        let second = factory.select_type(&policy, None, None);
        assert_ne!(first, second);
    }
}
