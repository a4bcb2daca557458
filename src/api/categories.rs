//! Category listing with per-category market counts.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::error::ApiResult;
use super::server::AppState;

#[derive(Serialize)]
pub struct Category {
    pub slug: String,
    pub name: String,
    pub count: i64,
}

#[derive(Serialize)]
pub struct CategoryListResponse {
    pub categories: Vec<Category>,
}

fn display_name(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn get_categories(
    State(state): State<AppState>,
) -> ApiResult<Json<CategoryListResponse>> {
    let categories = state
        .store
        .call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT category, COUNT(*)
                 FROM markets
                 WHERE category IS NOT NULL AND category != ''
                 GROUP BY category
                 ORDER BY COUNT(*) DESC",
            )?;
            let rows: Vec<(String, i64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            Ok(rows)
        })
        .await?;

    Ok(Json(CategoryListResponse {
        categories: categories
            .into_iter()
            .map(|(slug, count)| Category {
                name: display_name(&slug),
                slug,
                count,
            })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_titlecase_slugs() {
        assert_eq!(display_name("sports"), "Sports");
        assert_eq!(display_name("us-politics"), "Us Politics");
        assert_eq!(display_name("pop_culture"), "Pop Culture");
    }
}
