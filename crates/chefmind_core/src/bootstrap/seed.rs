//! Sample data for the in-memory fallback store.

use crate::model::Row;
use crate::store::schema::{FAVORITES, RECIPES, USERS};
use crate::store::{StorageBackend, StoreResult};
use serde_json::{json, Value};

pub const SAMPLE_SESSION_ID: &str = "browser-session-1";

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Writes one user, two recipes and one favorite; returns the record count.
pub fn seed_sample_data(backend: &dyn StorageBackend) -> StoreResult<usize> {
    backend.insert(
        USERS,
        &row(json!({
            "session_id": SAMPLE_SESSION_ID,
            "preferences": {"spice_level": "medium", "servings": 2},
            "dietary_restrictions": [],
            "favorite_cuisines": ["Chinese"],
            "cooking_skill_level": "beginner"
        })),
    )?;

    let eggs = backend.insert(
        RECIPES,
        &row(json!({
            "title": "Tomato Scrambled Eggs",
            "description": "A quick home-style dish of soft eggs and sweet-sour tomatoes.",
            "ingredients": [
                {"name": "tomato", "amount": "2"},
                {"name": "egg", "amount": "3"},
                {"name": "scallion", "amount": "1 stalk"}
            ],
            "instructions": [
                "Beat the eggs with a pinch of salt.",
                "Scramble the eggs until just set and set aside.",
                "Cook the tomatoes until soft, return the eggs and toss."
            ],
            "cooking_time": 15,
            "servings": 2,
            "difficulty": "easy",
            "cuisine_type": "Chinese",
            "category": "home_cooking",
            "tags": ["quick", "vegetarian"],
            "nutrition_info": {"calories": 220, "protein": 14.5},
            "is_ai_generated": false,
            "view_count": 0,
            "like_count": 0,
            "average_rating": 0.0,
            "rating_count": 0
        })),
    )?;

    backend.insert(
        RECIPES,
        &row(json!({
            "title": "Shredded Pork with Green Pepper",
            "description": "Stir-fried pork strips with crisp green peppers.",
            "ingredients": [
                {"name": "pork loin", "amount": "200g"},
                {"name": "green pepper", "amount": "2"},
                {"name": "soy sauce", "amount": "1 tbsp"}
            ],
            "instructions": [
                "Slice the pork into thin strips and marinate.",
                "Stir-fry the pork until it changes color.",
                "Add the peppers and season."
            ],
            "cooking_time": 20,
            "servings": 2,
            "difficulty": "medium",
            "cuisine_type": "Chinese",
            "category": "home_cooking",
            "tags": ["stir_fry", "pork"],
            "nutrition_info": {"calories": 380, "protein": 26.0},
            "is_ai_generated": false,
            "view_count": 0,
            "like_count": 0,
            "average_rating": 0.0,
            "rating_count": 0
        })),
    )?;

    backend.insert(
        FAVORITES,
        &row(json!({
            "session_id": SAMPLE_SESSION_ID,
            "recipe_id": eggs.id()
        })),
    )?;

    Ok(4)
}
