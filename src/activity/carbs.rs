//! Linear carbohydrate absorption.

use chrono::{DateTime, Utc};

use crate::types::MealEvent;

/// Grams of a single meal still unabsorbed at `at`.
///
/// Absorption is linear over the meal's absorption window; a meal
/// announced after `at` contributes nothing.
pub fn remaining_carbs(meal: &MealEvent, at: DateTime<Utc>) -> f64 {
    if meal.timestamp > at || meal.carbs_g <= 0.0 {
        return 0.0;
    }
    let window = f64::from(meal.absorption_minutes.max(1));
    let elapsed = (at - meal.timestamp).num_seconds() as f64 / 60.0;
    if elapsed >= window {
        return 0.0;
    }
    meal.carbs_g * (1.0 - elapsed / window)
}
