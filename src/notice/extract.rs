use chrono::Local;
use regex::Regex;
use select::document::Document;
use select::node::Node;
use select::predicate::{Name, Predicate};

use crate::config::SiteConfig;
use crate::models::NewNotice;

/// Listing pages rarely show more than one screen of items; anything past
/// this is old content we have already stored.
const MAX_CANDIDATES_PER_PAGE: usize = 20;

/// Container classes used by the campus CMS templates, tried in order.
const KNOWN_CONTAINER_CLASSES: &[&str] = &["wp_article_list", "news_list", "list_news"];

/// Extracts notice candidates from one fetched listing page.
///
/// Container discovery is a layered fallback: the site's configured class
/// hint, then the known CMS container classes, then any list item whose class
/// carries a news/list marker, and finally every list item on the page. The
/// first matcher that yields items wins. Items without a usable link are
/// skipped without failing the page.
pub fn extract(html: &str, site: &SiteConfig) -> Vec<NewNotice> {
    let doc = Document::from(html);
    let date_re = Regex::new(r"(\d{4})\s*[-/年]\s*(\d{1,2})\s*[-/月]\s*(\d{1,2})日?")
        .expect("date pattern is valid");

    let items = find_list_items(&doc, site);
    let base = site.link_base();
    let today = Local::now().format("%Y-%m-%d").to_string();

    let mut notices = Vec::new();
    for item in items {
        let Some((title, href)) = item_link(&item) else {
            continue;
        };
        let url = resolve_href(&href, &base, &site.url);
        let publish_date = scan_date(&item, &date_re).unwrap_or_else(|| today.clone());
        notices.push(NewNotice {
            site_id: site.id.clone(),
            title,
            url,
            publish_date,
        });
        if notices.len() >= MAX_CANDIDATES_PER_PAGE {
            break;
        }
    }

    if notices.is_empty() {
        tracing::warn!("site {} yielded no notice candidates", site.id);
    }
    notices
}

/// The layered container matchers. Each is an independent predicate over the
/// document; the first one producing at least one item wins.
fn find_list_items<'a>(doc: &'a Document, site: &SiteConfig) -> Vec<Node<'a>> {
    if let Some(hint) = &site.selector {
        let items = items_under_class(doc, hint);
        if !items.is_empty() {
            return items;
        }
    }
    for class in KNOWN_CONTAINER_CLASSES {
        let items = items_under_class(doc, class);
        if !items.is_empty() {
            return items;
        }
    }
    let items = items_with_marker_class(doc);
    if !items.is_empty() {
        return items;
    }
    all_list_items(doc)
}

/// List items below any element carrying the given class.
fn items_under_class<'a>(doc: &'a Document, class: &str) -> Vec<Node<'a>> {
    doc.find(Name("ul").or(Name("ol")).or(Name("div")))
        .filter(|n| has_class(n, class))
        .flat_map(|container| container.find(Name("li")).collect::<Vec<_>>())
        .collect()
}

/// List items whose own class name contains a news/list marker.
fn items_with_marker_class(doc: &Document) -> Vec<Node<'_>> {
    doc.find(Name("li"))
        .filter(|n| {
            n.attr("class")
                .map(|c| c.contains("news") || c.contains("list"))
                .unwrap_or(false)
        })
        .collect()
}

fn all_list_items(doc: &Document) -> Vec<Node<'_>> {
    doc.find(Name("li")).collect()
}

fn has_class(node: &Node, class: &str) -> bool {
    node.attr("class")
        .map(|attr| attr.split_whitespace().any(|c| c == class))
        .unwrap_or(false)
}

/// First descendant link with an href and non-empty visible text.
fn item_link(item: &Node) -> Option<(String, String)> {
    for link in item.find(Name("a")) {
        let href = match link.attr("href") {
            Some(h) if !h.trim().is_empty() => h.trim().to_string(),
            _ => continue,
        };
        let title = link.text().trim().to_string();
        if title.is_empty() {
            continue;
        }
        return Some((title, href));
    }
    None
}

/// Absolute hrefs pass through, root-relative ones are prefixed with the
/// site base, anything else is joined against the listing URL.
fn resolve_href(href: &str, base: &str, listing_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if href.starts_with('/') {
        return format!("{}{}", base, href);
    }
    if let Ok(listing) = url::Url::parse(listing_url) {
        if let Ok(resolved) = listing.join(href) {
            return resolved.to_string();
        }
    }
    href.to_string()
}

/// First year-month-day match in the item's text, with '-', '/', or 年/月/日
/// separators, normalized to YYYY-MM-DD.
fn scan_date(item: &Node, date_re: &Regex) -> Option<String> {
    let text = item.text();
    let caps = date_re.captures(&text)?;
    let year: u32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = caps.get(3)?.as_str().parse().ok()?;
    Some(format!("{:04}-{:02}-{:02}", year, month, day))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(selector: Option<&str>) -> SiteConfig {
        SiteConfig {
            id: "main".to_string(),
            name: "学校官网通知公告".to_string(),
            url: "https://www.nimt.edu.cn/739/list.htm".to_string(),
            base_url: Some("https://www.nimt.edu.cn".to_string()),
            selector: selector.map(|s| s.to_string()),
            enabled: true,
            remark: String::new(),
        }
    }

    #[test]
    fn extracts_from_known_container() {
        let html = r#"
            <html><body>
            <ul class="wp_article_list">
              <li><a href="/739/c1.htm">关于开学的通知</a><span>2024-03-05</span></li>
              <li><a href="/739/c2.htm">关于放假的通知</a><span>2024/3/6</span></li>
            </ul>
            <ul><li><a href="/nav/home.htm">首页</a></li></ul>
            </body></html>"#;
        let notices = extract(html, &site(None));
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].url, "https://www.nimt.edu.cn/739/c1.htm");
        assert_eq!(notices[0].publish_date, "2024-03-05");
        assert_eq!(notices[1].publish_date, "2024-03-06");
    }

    #[test]
    fn selector_hint_takes_precedence() {
        let html = r#"
            <ul class="custom_box"><li><a href="/a.htm">自定义容器里的通知</a></li></ul>
            <ul class="wp_article_list"><li><a href="/b.htm">别的通知</a></li></ul>"#;
        let notices = extract(html, &site(Some("custom_box")));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].url, "https://www.nimt.edu.cn/a.htm");
    }

    #[test]
    fn marker_class_fallback() {
        let html = r#"
            <div><li class="news-item"><a href="/c.htm">教务通知</a> 2024年3月7日</li></div>"#;
        let notices = extract(html, &site(None));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].publish_date, "2024-03-07");
    }

    #[test]
    fn falls_back_to_every_list_item() {
        let html = r#"<ol><li><a href="/d.htm">最后兜底的通知</a></li></ol>"#;
        let notices = extract(html, &site(None));
        assert_eq!(notices.len(), 1);
    }

    #[test]
    fn date_separators_all_normalize() {
        for (raw, want) in [
            ("2024年3月5日", "2024-03-05"),
            ("2024/3/5", "2024-03-05"),
            ("2024-03-05", "2024-03-05"),
        ] {
            let html = format!(
                r#"<ul class="news_list"><li><a href="/e.htm">通知</a><span>{}</span></li></ul>"#,
                raw
            );
            let notices = extract(&html, &site(None));
            assert_eq!(notices[0].publish_date, want, "input {}", raw);
        }
    }

    #[test]
    fn missing_date_defaults_to_today() {
        let html = r#"<ul class="news_list"><li><a href="/f.htm">无日期通知</a></li></ul>"#;
        let notices = extract(html, &site(None));
        assert_eq!(
            notices[0].publish_date,
            Local::now().format("%Y-%m-%d").to_string()
        );
    }

    #[test]
    fn resolves_absolute_root_relative_and_relative() {
        let html = r#"
            <ul class="news_list">
              <li><a href="https://other.edu.cn/x.htm">绝对链接</a></li>
              <li><a href="/739/y.htm">根相对链接</a></li>
              <li><a href="z.htm">相对链接</a></li>
            </ul>"#;
        let notices = extract(html, &site(None));
        assert_eq!(notices[0].url, "https://other.edu.cn/x.htm");
        assert_eq!(notices[1].url, "https://www.nimt.edu.cn/739/y.htm");
        assert_eq!(notices[2].url, "https://www.nimt.edu.cn/739/z.htm");
    }

    #[test]
    fn three_items_two_usable() {
        // Two valid links with dates, one with an empty title.
        let html = r#"
            <ul class="wp_article_list">
              <li><a href="/739/1.htm">第一条通知</a> 2024-06-01</li>
              <li><a href="/739/2.htm">第二条通知</a> 2024-06-02</li>
              <li><a href="/739/3.htm">   </a> 2024-06-03</li>
            </ul>"#;
        let notices = extract(html, &site(None));
        assert_eq!(notices.len(), 2);
    }

    #[test]
    fn empty_page_is_not_an_error() {
        let notices = extract("<html><body><p>装修中</p></body></html>", &site(None));
        assert!(notices.is_empty());
    }
}
