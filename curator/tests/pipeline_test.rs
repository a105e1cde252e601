mod support;

use std::sync::Arc;
use std::time::Duration;

use curator::client::{RetryPolicy, RetryingClient};
use curator::cluster::{ClusterSettings, Clusterer};
use curator::control::RunControl;
use curator::output::{render_feed, FeedContent, FeedLanguage};
use curator::pipeline::{ClusteringStatus, CurationSettings, Curator};
use curator::scheduler::{BatchScheduler, EnsembleMember, SchedulerSettings};

use support::{candidates, member, FakeProvider};

fn round_settings() -> SchedulerSettings {
    SchedulerSettings {
        inter_call_pause: Duration::from_secs(8),
        round_pause: Duration::from_secs(20),
        ..SchedulerSettings::default()
    }
}

fn clusterer(provider: Arc<FakeProvider>) -> Clusterer {
    Clusterer::new(
        RetryingClient::new(provider, RetryPolicy::default().with_max_attempts(1)),
        ClusterSettings::default(),
    )
}

fn build_curator(members: Vec<EnsembleMember>, clusterer: Option<Clusterer>) -> Curator {
    Curator::new(
        BatchScheduler::new(members, round_settings()),
        clusterer,
        CurationSettings::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_consensus_requires_two_voters() {
    let a = FakeProvider::selecting("A", &["Budget", "Floods"]);
    let b = FakeProvider::selecting("B", &["Budget"]);
    let curator = build_curator(vec![member(a, "p1", 10), member(b, "p2", 10)], None);
    let list = candidates(&["Budget passed in parliament", "Floods hit northern districts", "Cricket team wins"]);

    let report = curator.curate(&list, &RunControl::new()).await.unwrap();

    assert_eq!(report.consensus_selected, 1);
    assert_eq!(report.stories.len(), 1);
    let story = &report.stories[0];
    assert_eq!(story.main.candidate.id, 0);
    assert_eq!(story.main.selected_by, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(story.main.category, "BCS/Bank/GK");
    assert_eq!(story.main.reason, "Selected by multi-model consensus");
    assert_eq!(report.clustering, ClusteringStatus::Disabled);
}

#[tokio::test(start_paused = true)]
async fn test_first_categorization_wins() {
    let a = FakeProvider::new("A", |_| {
        Ok(r#"[{"id": 0, "category": "Economy", "reason": "Monetary policy"}]"#.to_string())
    });
    let b = FakeProvider::new("B", |_| {
        Ok(r#"[{"id": 0, "category": "Politics", "reason": "Other"}]"#.to_string())
    });
    let curator = build_curator(vec![member(a, "p1", 10), member(b, "p2", 10)], None);

    let report = curator
        .curate(&candidates(&["Repo rate cut"]), &RunControl::new())
        .await
        .unwrap();

    assert_eq!(report.stories[0].main.category, "Economy");
    assert_eq!(report.stories[0].main.reason, "Monetary policy");
}

#[tokio::test(start_paused = true)]
async fn test_near_duplicates_collapse() {
    let a = FakeProvider::selecting("A", &["repo"]);
    let b = FakeProvider::selecting("B", &["repo"]);
    let curator = build_curator(vec![member(a, "p1", 10), member(b, "p2", 10)], None);
    let mut list = candidates(&["BB cuts repo rate to 8.5%", "Bangladesh Bank cuts repo rate to 8.5 percent"]);
    list[0].description = "Short".to_string();
    list[1].description = "The central bank lowered its policy rate by 50 basis points".to_string();

    let report = curator.curate(&list, &RunControl::new()).await.unwrap();

    assert_eq!(report.consensus_selected, 2);
    assert_eq!(report.after_dedupe, 1);
    assert_eq!(report.stories[0].main.candidate.id, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cluster_error_falls_back_to_singletons() {
    let a = FakeProvider::selecting("A", &["Budget", "Metro"]);
    let b = FakeProvider::selecting("B", &["Budget", "Metro"]);
    let cluster_model = FakeProvider::new("gemini-2.5-flash-lite", |_| {
        Ok(r#"{"error": "quota exceeded"}"#.to_string())
    });
    let curator = build_curator(
        vec![member(a, "p1", 10), member(b, "p2", 10)],
        Some(clusterer(cluster_model.clone())),
    );
    let list = candidates(&["Budget passed in parliament", "Metro rail extends hours"]);

    let report = curator.curate(&list, &RunControl::new()).await.unwrap();

    assert_eq!(report.clustering, ClusteringStatus::Unavailable);
    assert_eq!(report.stories.len(), 2);
    for (position, story) in report.stories.iter().enumerate() {
        assert!(story.related.is_empty());
        assert_eq!(story.cluster_id, position);
        assert_eq!(story.main.cluster_id, position);
    }
    assert_eq!(cluster_model.prompts().len(), 1);
    assert!(cluster_model.prompts()[0].starts_with("ARTICLES:\n0\tBudget passed in parliament\t"));
}

#[tokio::test(start_paused = true)]
async fn test_cluster_reply_groups_related_stories() {
    let a = FakeProvider::selecting("A", &["Budget", "Metro", "Commuters"]);
    let b = FakeProvider::selecting("B", &["Budget", "Metro", "Commuters"]);
    let cluster_model = FakeProvider::new("gemini-2.5-flash-lite", |_| {
        Ok("```json\n[{\"cluster_id\": 0, \"main\": 1, \"members\": [1, 2]}]\n```".to_string())
    });
    let curator = build_curator(
        vec![member(a, "p1", 10), member(b, "p2", 10)],
        Some(clusterer(cluster_model)),
    );
    let list = candidates(&[
        "Budget passed in parliament",
        "Metro rail extends hours",
        "Commuters welcome longer metro service",
    ]);

    let report = curator.curate(&list, &RunControl::new()).await.unwrap();

    assert_eq!(report.clustering, ClusteringStatus::Applied);
    assert_eq!(report.stories.len(), 2);
    assert_eq!(report.stories[0].main.candidate.id, 0);
    assert_eq!(report.stories[0].cluster_id, 1);
    let metro = &report.stories[1];
    assert_eq!(metro.main.candidate.id, 1);
    assert_eq!(metro.related.len(), 1);
    assert_eq!(metro.related[0].candidate.id, 2);
    assert_eq!(report.items().count(), 3);

    let stories: Vec<_> = report.stories.iter().collect();
    let xml = render_feed(FeedLanguage::English, "https://x.example", FeedContent::Stories(&stories), chrono::Utc::now()).unwrap();
    assert!(xml.contains("Similar items:"));
}

#[tokio::test(start_paused = true)]
async fn test_no_consensus_is_an_empty_result() {
    let a = FakeProvider::selecting("A", &["Budget"]);
    let b = FakeProvider::selecting("B", &["Floods"]);
    let cluster_model = FakeProvider::new("c", |_| Ok("[]".to_string()));
    let curator = build_curator(
        vec![member(a, "p1", 10), member(b, "p2", 10)],
        Some(clusterer(cluster_model.clone())),
    );

    let report = curator
        .curate(&candidates(&["Budget passed", "Floods hit"]), &RunControl::new())
        .await
        .unwrap();

    assert!(report.is_empty());
    assert!(cluster_model.prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_budget_abort_keeps_partial_results() {
    let a = FakeProvider::selecting("A", &["Story"]);
    let b = FakeProvider::selecting("B", &["Story"]);
    let curator = build_curator(vec![member(a, "p1", 1), member(b, "p2", 1)], None);
    let list = candidates(&["Story one", "Story two", "Story three"]);
    let control = RunControl::with_budget(Some(Duration::from_secs(30)));

    let report = curator.curate(&list, &control).await.unwrap();

    assert!(report.aborted);
    assert_eq!(report.rounds_completed, 1);
    assert_eq!(report.stories.len(), 1);
    assert_eq!(report.stories[0].main.candidate.id, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejects_ids_that_do_not_match_positions() {
    let a = FakeProvider::selecting("A", &["x"]);
    let curator = build_curator(vec![member(a, "p1", 10)], None);
    let mut list = candidates(&["x", "y"]);
    list[1].id = 7;

    assert!(curator.curate(&list, &RunControl::new()).await.is_err());
}
