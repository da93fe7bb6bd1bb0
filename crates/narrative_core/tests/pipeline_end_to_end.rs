use narrative_core::analysis::{build_analysis_records, EventCalendar, TriggerStates};
use narrative_core::classify::{propagate_labels, Candidate, FittedPipeline};
use narrative_core::classify::text::TfidfRecipe;
use narrative_core::clean::clean_posts;
use narrative_core::io;
use narrative_core::schema::{Engagement, LabeledExample, NarrativeLabel, Party, RawPost};
use narrative_core::topic::TopicFilter;
use std::fs;
use tempfile::TempDir;
use time::macros::date;

fn calendar() -> EventCalendar {
    EventCalendar::new(
        vec![date!(2022 - 05 - 02), date!(2022 - 06 - 24), date!(2022 - 08 - 02), date!(2022 - 11 - 08)],
        ["pre_leak", "leak_to_ruling", "ruling_to_kansas", "kansas_to_midterm", "post_midterm"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        date!(2022 - 06 - 24),
    )
    .unwrap()
}

fn raw(id: &str, handle: &str, created_at: &str, text: &str) -> RawPost {
    RawPost {
        id: id.to_string(),
        author_id: format!("author-{handle}"),
        handle: handle.to_string(),
        created_at: created_at.to_string(),
        text: text.to_string(),
        conversation_id: Some(id.to_string()),
        engagement: Some(Engagement {
            reply_count: Some(2),
            repost_count: Some(0),
            like_count: Some(10),
            quote_count: None,
        }),
    }
}

fn pipeline() -> FittedPipeline {
    let docs = [
        "rights stolen freedom lost",
        "dark day rights stripped",
        "we organize and win",
        "volunteers mobilize to vote",
    ];
    let recipe = TfidfRecipe::fit(&docs, 100, &[]);
    let classifier = Candidate::MultinomialNb { alpha: 1.0 }
        .fit(&recipe.transform_all(&docs), &[true, true, false, false])
        .unwrap();
    FittedPipeline {
        name: "multinomial_nb".to_string(),
        params: "alpha=1".to_string(),
        recipe,
        classifier,
    }
}

#[test]
fn one_matching_post_keeps_its_legislators_party() {
    let dir = TempDir::new().unwrap();
    let politicians_path = dir.path().join("politicians.csv");
    fs::write(
        &politicians_path,
        "handle,name,chamber,state,party\n\
         @SenAlice,Alice Adams,Senate,CA,D\n\
         RepBob,Bob Brown,House,NY,Democratic\n\
         SenCarol,Carol Cruz,sen,TX,R\n",
    )
    .unwrap();
    let politicians = io::read_politicians(&politicians_path).unwrap();

    let raw_posts = vec![
        raw("1", "SenAlice", "2022-03-01T15:00:00Z", "Visiting farms across the valley today"),
        raw("2", "SenAlice", "2022-07-15T15:00:00Z", "Infrastructure money is arriving"),
        raw("3", "RepBob", "2022-02-10T09:30:00Z", "Town hall on Thursday night"),
        raw("4", "RepBob", "2022-09-01T09:30:00Z", "Our schools need more counselors"),
        raw("5", "SenCarol", "2022-04-20T18:45:00Z", "Border security briefing this week"),
        raw("6", "SenCarol", "2022-07-01T18:45:00Z", "The Abortion ruling stripped rights from women"),
    ];
    let (clean, summary) = clean_posts(raw_posts).unwrap();
    assert_eq!(summary.output, 6);

    let clean_path = dir.path().join("clean_posts.csv");
    io::write_csv(&clean_path, &clean).unwrap();
    let clean = io::read_clean_posts(&clean_path).unwrap();

    let topic = TopicFilter::new("abortion", true).unwrap().apply(clean);
    assert_eq!(topic.len(), 1);
    assert_eq!(topic[0].id, "6");

    let annotations = vec![LabeledExample {
        id: "6".to_string(),
        text: topic[0].text.clone(),
        label: NarrativeLabel::Decline,
    }];
    let labeled = propagate_labels(&pipeline(), &topic, &annotations).unwrap();
    let set = build_analysis_records(&labeled, &politicians, &calendar(), &TriggerStates::default()).unwrap();

    assert_eq!(set.records.len(), 1);
    let record = &set.records[0];
    assert_eq!(record.handle, "sencarol");
    assert_eq!(record.party, Party::Republican);
    assert_eq!(record.legislator_name, "Carol Cruz");
    assert!(record.trigger_state);
    assert!(record.post_ruling);
    assert_eq!(record.window_name, "ruling_to_kansas");
    assert_eq!(record.label, NarrativeLabel::Decline);
    assert!(set.unmatched.is_empty());

    let records_path = dir.path().join("analysis_records.csv");
    io::write_analysis_records(&records_path, &set.records).unwrap();
    let written = fs::read_to_string(&records_path).unwrap();
    assert!(written.lines().next().unwrap().starts_with("post_id,handle,legislator"));
    assert_eq!(written.lines().count(), 2);
}

#[test]
fn labeled_posts_survive_a_csv_round_trip_with_manual_labels_intact() {
    let dir = TempDir::new().unwrap();
    let (clean, _) = clean_posts(vec![
        raw("10", "SenAlice", "2022-06-30T12:00:00Z", "abortion rights stolen today"),
        raw("11", "SenAlice", "2022-07-02T12:00:00Z", "abortion access: we organize and win"),
    ])
    .unwrap();
    let annotations = vec![LabeledExample {
        id: "11".to_string(),
        text: String::new(),
        label: NarrativeLabel::Decline,
    }];
    let labeled = propagate_labels(&pipeline(), &clean, &annotations).unwrap();
    let path = dir.path().join("labeled_posts.csv");
    io::write_csv(&path, &labeled).unwrap();
    let back = io::read_labeled_posts(&path).unwrap();

    assert_eq!(back, labeled);
    let manual = back.iter().find(|p| p.id == "11").unwrap();
    assert_eq!(manual.manual_label, Some(NarrativeLabel::Decline));
    assert_eq!(manual.predicted_label, NarrativeLabel::Rising);
    assert_eq!(manual.effective_label(), NarrativeLabel::Decline);
}
