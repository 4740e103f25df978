//! Release Formatter.
//!
//! Pure renderers for the three release schemas plus a writer that replaces
//! the target file. Identical inputs give byte-identical output.

use crate::details::DetailBatch;
use crate::extract::RecordId;
use crate::reviews::Judgments;
use std::collections::HashMap;
use std::path::Path;

/// Everything the topic file says about one review
#[derive(Debug, Clone)]
pub struct TopicRecord<'a> {
    pub review_doi: &'a str,
    pub title: &'a str,
    pub query: &'a str,
    pub pids: &'a [RecordId],
}

/// Render a topic file.
pub fn render_topic(topic: &TopicRecord<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!("Topic: {} \n\n", topic.review_doi));
    out.push_str(&format!("Title: {} \n\n", topic.title));
    out.push_str(&format!("Query: \n{} \n\n", topic.query));
    out.push_str("Pids: \n");
    for pid in topic.pids {
        out.push_str(&format!("    {} \n", pid));
    }
    out
}

/// Render a qrel file: one line per identifier, in identifier order.
///
/// Judgments are passed through from the relevance index; identifiers it
/// does not mention are judged 0.
pub fn render_qrels(review_doi: &str, pids: &[RecordId], judgments: &Judgments) -> String {
    pids.iter()
        .map(|pid| {
            format!(
                "{:<12} {:<2} {:<12} {:<2} \n",
                review_doi,
                0,
                pid,
                judgments.get(review_doi, pid)
            )
        })
        .collect()
}

/// Render a TREC-text file: one `<DOC>` per identifier, in identifier order.
///
/// Identifiers without a title or abstract still get a record, with the
/// field left empty.
pub fn render_trectext(
    pids: &[RecordId],
    titles: &HashMap<&str, &str>,
    abstracts: &HashMap<&str, &str>,
) -> String {
    pids.iter()
        .map(|pid| {
            let title = titles.get(pid.as_str()).copied().unwrap_or_default();
            let abstract_text = abstracts.get(pid.as_str()).copied().unwrap_or_default();
            format!(
                "<DOC>\n<DOCNO>{}</DOCNO>\n<TITLE>{}</TITLE>\n<TEXT>{}</TEXT>\n</DOC>\n\n",
                pid, title, abstract_text
            )
        })
        .collect()
}

/// Render a topic's TREC-text from its downloaded detail batches.
///
/// A batch that was never downloaded leaves that field empty everywhere.
pub fn render_topic_trectext(
    pids: &[RecordId],
    titles: Option<&DetailBatch>,
    abstracts: Option<&DetailBatch>,
) -> String {
    let titles = titles.map(DetailBatch::lookup).unwrap_or_default();
    let abstracts = abstracts.map(DetailBatch::lookup).unwrap_or_default();
    render_trectext(pids, &titles, &abstracts)
}

/// Replace `path` with `contents`.
pub fn write_release(path: &Path, contents: &str) -> crate::Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::details::{DetailEntry, DetailKind};
    use tempfile::TempDir;

    fn pids(list: &[&str]) -> Vec<RecordId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn judgments() -> Judgments {
        let mut j = Judgments::default();
        j.insert("CD007394", "222", 1);
        j
    }

    #[test]
    fn test_topic_layout() {
        let ids = pids(&["111", "222"]);
        let text = render_topic(&TopicRecord {
            review_doi: "CD007394",
            title: "Screening for dementia",
            query: "1. exp Dementia/\n2. 1 and screening",
            pids: &ids,
        });
        assert_eq!(
            text,
            "Topic: CD007394 \n\nTitle: Screening for dementia \n\nQuery: \n1. exp Dementia/\n2. 1 and screening \n\nPids: \n    111 \n    222 \n"
        );
    }

    #[test]
    fn test_qrel_columns() {
        let text = render_qrels("CD007394", &pids(&["111", "222"]), &judgments());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "CD007394     0  111          0  ");
        assert_eq!(lines[1], "CD007394     0  222          1  ");
    }

    #[test]
    fn test_trectext_keeps_missing_abstract_in_order() {
        let ids = pids(&["111", "222", "333"]);
        let titles: HashMap<&str, &str> =
            [("111", "One"), ("222", "Two"), ("333", "Three")].into_iter().collect();
        let abstracts: HashMap<&str, &str> = [("111", "A1"), ("333", "A3")].into_iter().collect();

        let text = render_trectext(&ids, &titles, &abstracts);
        assert_eq!(text.matches("<DOC>").count(), 3);
        assert!(text.contains("<DOCNO>222</DOCNO>\n<TITLE>Two</TITLE>\n<TEXT></TEXT>"));

        let positions: Vec<usize> = ["111", "222", "333"]
            .iter()
            .map(|id| text.find(&format!("<DOCNO>{}</DOCNO>", id)).expect("record present"))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_qrel_and_trectext_share_order() {
        let ids = pids(&["9", "3", "5"]);
        let qrels = render_qrels("CD1", &ids, &Judgments::default());
        let trec = render_trectext(&ids, &HashMap::new(), &HashMap::new());

        let qrel_order: Vec<&str> = qrels
            .lines()
            .filter_map(|l| l.split_whitespace().nth(2))
            .collect();
        let trec_order: Vec<&str> = trec
            .lines()
            .filter_map(|l| l.strip_prefix("<DOCNO>").and_then(|r| r.strip_suffix("</DOCNO>")))
            .collect();
        assert_eq!(qrel_order, trec_order);
    }

    #[test]
    fn test_rewrite_is_byte_identical() -> crate::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("CD1");
        let ids = pids(&["1", "2"]);

        write_release(&path, &render_qrels("CD1", &ids, &judgments()))?;
        let first = std::fs::read(&path)?;
        write_release(&path, &render_qrels("CD1", &ids, &judgments()))?;
        assert_eq!(first, std::fs::read(&path)?);
        Ok(())
    }

    #[test]
    fn test_topic_trectext_from_stored_batches() -> crate::Result<()> {
        let temp = TempDir::new()?;
        let title_path = temp.path().join("7.title.csv");
        DetailBatch {
            kind: DetailKind::Title,
            entries: vec![
                DetailEntry { id: "111".into(), text: Some("One".into()) },
                DetailEntry { id: "222".into(), text: None },
            ],
        }
        .write_csv(&title_path)?;

        let titles = DetailBatch::read_optional(&title_path, DetailKind::Title)?;
        let abstracts =
            DetailBatch::read_optional(&temp.path().join("7.abstract.csv"), DetailKind::Abstract)?;
        let text = render_topic_trectext(&pids(&["111", "222"]), titles.as_ref(), abstracts.as_ref());

        assert_eq!(
            text,
            "<DOC>\n<DOCNO>111</DOCNO>\n<TITLE>One</TITLE>\n<TEXT></TEXT>\n</DOC>\n\n\
             <DOC>\n<DOCNO>222</DOCNO>\n<TITLE></TITLE>\n<TEXT></TEXT>\n</DOC>\n\n"
        );
        Ok(())
    }
}
