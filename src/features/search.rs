//! Full-text search over titles and sentences of every lesson

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use super::navigation::{LessonId, LessonLink};
use crate::api::{Fetcher, fetch_json};
use crate::error::FetchError;

/// Results beyond this many are dropped
pub const MAX_RESULTS: usize = 50;

/// One lesson in the prebuilt index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedLesson {
    /// Book, e.g. `NCE2`
    pub b: String,
    /// Lesson filename
    pub l: String,
    /// Title
    pub t: String,
    /// `[line index, en, cn]`
    #[serde(default)]
    pub c: Vec<(usize, String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchHit {
    Title {
        lesson: LessonId,
        title: String,
    },
    Sentence {
        lesson: LessonId,
        title: String,
        line: usize,
        en: String,
        cn: String,
        matched_en: bool,
        matched_cn: bool,
    },
}

impl SearchHit {
    pub fn lesson(&self) -> &LessonId {
        match self {
            Self::Title { lesson, .. } | Self::Sentence { lesson, .. } => lesson,
        }
    }

    /// Where the hit opens; sentence hits jump to their line
    pub fn link(&self) -> LessonLink {
        match self {
            Self::Title { lesson, .. } => LessonLink::new(lesson.clone(), None),
            Self::Sentence { lesson, line, .. } => LessonLink::new(lesson.clone(), Some(*line)),
        }
    }
}

/// Human name of a book id
pub fn book_label(book: &str) -> &str {
    match book {
        "NCE1" => "第一册",
        "NCE2" => "第二册",
        "NCE3" => "第三册",
        "NCE4" => "第四册",
        other => other,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SearchIndex {
    lessons: Vec<IndexedLesson>,
}

impl SearchIndex {
    pub fn new(lessons: Vec<IndexedLesson>) -> Self {
        Self { lessons }
    }

    pub async fn load(fetcher: &dyn Fetcher, url: &str) -> Result<Self, FetchError> {
        let index: Self = fetch_json(fetcher, url).await?;
        tracing::info!("Search index loaded: {} lessons", index.lessons.len());
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.lessons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty()
    }

    /// Title matches win over sentence matches of the same lesson
    pub fn query(&self, query: &str) -> Vec<SearchHit> {
        let query = query.trim().to_lowercase();
        let mut hits = Vec::new();
        if query.is_empty() {
            return hits;
        }
        for lesson in &self.lessons {
            if hits.len() >= MAX_RESULTS {
                break;
            }
            let id = LessonId::new(lesson.b.clone(), lesson.l.clone());
            if lesson.t.to_lowercase().contains(&query) {
                hits.push(SearchHit::Title {
                    lesson: id,
                    title: lesson.t.clone(),
                });
                continue;
            }
            for (line, en, cn) in &lesson.c {
                if hits.len() >= MAX_RESULTS {
                    break;
                }
                let matched_en = en.to_lowercase().contains(&query);
                let matched_cn = cn.contains(&query);
                if matched_en || matched_cn {
                    hits.push(SearchHit::Sentence {
                        lesson: id.clone(),
                        title: lesson.t.clone(),
                        line: *line,
                        en: en.clone(),
                        cn: cn.clone(),
                        matched_en,
                        matched_cn,
                    });
                }
            }
        }
        hits
    }
}

/// Wrap every case-insensitive occurrence of `query` in `open`/`close`
pub fn highlight(text: &str, query: &str, open: &str, close: &str) -> String {
    if query.is_empty() {
        return text.to_string();
    }
    match RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re
            .replace_all(text, |caps: &regex::Captures| format!("{}{}{}", open, &caps[0], close))
            .into_owned(),
        Err(_) => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryFetcher;

    fn index() -> SearchIndex {
        serde_json::from_str(
            r#"[
                {"b":"NCE2","l":"01-A Private Conversation","t":"A private conversation",
                 "c":[[0,"Last week I went to the theatre.","上星期我去看戏。"],[1,"I had a very good seat.","我的座位很好。"]]},
                {"b":"NCE2","l":"02-Breakfast or Lunch","t":"Breakfast or lunch?",
                 "c":[[3,"It was Sunday. I never get up early on Sundays.","那是个星期天。"]]}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_title_match_skips_content() {
        let hits = index().query("  PRIVATE ");
        assert_eq!(hits.len(), 1);
        assert!(matches!(&hits[0], SearchHit::Title { title, .. } if title == "A private conversation"));
        assert_eq!(hits[0].link().href(), "lesson.html#NCE2/01-A Private Conversation");
    }

    #[test]
    fn test_sentence_matches() {
        let hits = index().query("星期");
        assert_eq!(hits.len(), 2);
        let SearchHit::Sentence { line, matched_en, matched_cn, .. } = &hits[1] else {
            panic!("expected a sentence hit");
        };
        assert_eq!(*line, 3);
        assert!(!matched_en);
        assert!(matched_cn);
        assert_eq!(hits[1].link().href(), "lesson.html#NCE2/02-Breakfast or Lunch?line=3");
        assert!(index().query("   ").is_empty());
    }

    #[test]
    fn test_result_cap() {
        let lesson = IndexedLesson {
            b: "NCE1".into(),
            l: "001".into(),
            t: "Excuse me".into(),
            c: (0..80).map(|i| (i, format!("Is this your pen {}?", i), String::new())).collect(),
        };
        let hits = SearchIndex::new(vec![lesson]).query("pen");
        assert_eq!(hits.len(), MAX_RESULTS);
    }

    #[test]
    fn test_highlight() {
        assert_eq!(highlight("Seat and SEAT", "seat", "<b>", "</b>"), "<b>Seat</b> and <b>SEAT</b>");
        assert_eq!(highlight("a.b", ".", "[", "]"), "a[.]b");
        assert_eq!(highlight("text", "", "[", "]"), "text");
        assert_eq!(book_label("NCE3"), "第三册");
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let fetcher = MemoryFetcher::new();
        assert!(SearchIndex::load(&fetcher, "static/search_index.json").await.is_err());
        fetcher.insert("static/search_index.json", "[]");
        assert!(SearchIndex::load(&fetcher, "static/search_index.json").await.unwrap().is_empty());
    }
}
