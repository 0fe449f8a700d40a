use issue_search_core::tokenizer::{tokenize, Analyzer, AnalyzerConfig};

#[test]
fn it_normalizes_and_stems() {
    let words = tokenize("Running Runners RUN! The ｆｕｌｌｗｉｄｔｈ parser.");
    // Stemming to "run" should appear
    assert!(words.contains(&"run".to_string()));
    // NFKC folds fullwidth letters
    assert!(words.contains(&"fullwidth".to_string()));
    assert!(words.contains(&"parser".to_string()));
}

#[test]
fn it_filters_stopwords() {
    let words = tokenize("The quick brown fox and the lazy dog");
    assert!(!words.contains(&"the".to_string()));
    assert!(!words.contains(&"and".to_string()));
    assert!(words.contains(&"fox".to_string()));
}

#[test]
fn query_and_document_share_the_pipeline() {
    let analyzer = Analyzer::default();
    assert_eq!(analyzer.analyze("crashes"), analyzer.analyze("CRASHED"));
}

#[test]
fn stages_can_be_switched_off() {
    let analyzer = Analyzer::new(AnalyzerConfig { stopwords: false, stemming: true });
    let words = analyzer.analyze("the parsers");
    assert_eq!(words, vec!["the", "parser"]);
}

#[test]
fn punctuation_only_yields_nothing() {
    assert!(tokenize("?!... --- ***").is_empty());
}
