//! Paged recipe source backed by the public listing and detail pages.
//!
//! Listing page `N` lives at `{base_url}{list_path}?page=N` and links each
//! recipe as `/recipe/{id}`. Detail pages carry the title, description,
//! ingredient list, step texts, image references and the recipe's category
//! links. The listing page also links every category value the site offers.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use larder_shared::{
    Ingredient, ItemId, ItemRef, LarderError, RAW_SCHEMA_VERSION, RawRecord, RecipeCategories,
    Result, SourceConfig, SourceFetcher,
};

use crate::net::{self, compute_hash};

static RECIPE_HREF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/recipe/(\d+)/?(?:[?#].*)?$").ok());

/// Listing filter link such as `?cat4=63`.
static CATEGORY_PARAM: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[?&](cat[1-4])=(\d+)").ok());

/// Link text the site uses for the "no filter" entry of every axis.
const ALL_CATEGORIES: &str = "전체";

/// Category axes in the order the site lists them, keyed by query parameter.
pub const CATEGORY_AXES: [(&str, &str); 4] = [
    ("cat4", "kind"),
    ("cat2", "situation"),
    ("cat3", "ingredient"),
    ("cat1", "method"),
];

/// One selectable value of a category axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryEntry {
    pub code: String,
    pub name: String,
}

/// Every category value the listing page offers, by axis name.
pub type CategoryCatalog = BTreeMap<&'static str, Vec<CategoryEntry>>;

// ---------------------------------------------------------------------------
// HttpSource
// ---------------------------------------------------------------------------

/// [`SourceFetcher`] over HTTP.
pub struct HttpSource {
    client: Client,
    base_url: Url,
    list_path: String,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpSource {
    /// Create a source from the `[source]` config section.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            LarderError::config(format!("invalid source.base_url '{}': {e}", config.base_url))
        })?;

        Ok(Self {
            client: net::build_client(Duration::from_secs(config.timeout_secs))?,
            base_url,
            list_path: config.list_path.clone(),
            allow_localhost: false,
        })
    }

    /// Allow fetching from localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    fn list_url(&self) -> Result<Url> {
        self.base_url
            .join(&self.list_path)
            .map_err(|e| LarderError::config(format!("invalid source.list_path: {e}")))
    }

    fn listing_url(&self, page: u64) -> Result<Url> {
        let mut url = self.list_url()?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        Ok(url)
    }

    fn detail_url(&self, id: &ItemId) -> Result<Url> {
        self.base_url
            .join(&format!("/recipe/{id}"))
            .map_err(|e| LarderError::validation(format!("invalid recipe id '{id}': {e}")))
    }

    /// Fetch the category values offered on the listing page.
    #[instrument(skip(self))]
    pub async fn fetch_categories(&self) -> Result<CategoryCatalog> {
        let url = self.list_url()?;
        let body = net::get(&self.client, &url, self.allow_localhost)
            .await?
            .text()
            .await
            .map_err(|e| net::send_error(&url, e))?;

        let catalog = parse_category_catalog(&body)?;
        debug!(axes = catalog.len(), "category catalog parsed");
        Ok(catalog)
    }
}

#[async_trait]
impl SourceFetcher for HttpSource {
    #[instrument(skip(self), fields(page = cursor))]
    async fn fetch_page(&self, cursor: u64) -> Result<Vec<ItemRef>> {
        let url = self.listing_url(cursor)?;
        let body = net::get(&self.client, &url, self.allow_localhost)
            .await?
            .text()
            .await
            .map_err(|e| net::send_error(&url, e))?;

        let items = parse_listing(&body)?;
        debug!(count = items.len(), "listing page parsed");
        Ok(items)
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn fetch_detail(&self, id: &ItemId) -> Result<RawRecord> {
        let url = self.detail_url(id)?;
        let body = net::get(&self.client, &url, self.allow_localhost)
            .await?
            .text()
            .await
            .map_err(|e| net::send_error(&url, e))?;

        parse_detail(id, &url, &body)
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| LarderError::parse(format!("bad selector '{css}': {e}")))
}

/// Collapse an element's text into single-spaced, trimmed form.
fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract a numeric recipe id from an `href` like `/recipe/6912345`.
pub fn extract_recipe_id(href: &str) -> Option<ItemId> {
    RECIPE_HREF
        .as_ref()?
        .captures(href)
        .and_then(|c| c.get(1))
        .map(|m| ItemId::new(m.as_str()))
}

/// Strip the thumbnail suffix so the URL points at the original image.
///
/// `.../abc_m.jpg` becomes `.../abc.jpg`.
pub fn clean_image_url(url: &str) -> String {
    url.replace("_m.", ".")
}

/// Axis name for a listing query parameter.
fn category_axis(param: &str) -> Option<&'static str> {
    CATEGORY_AXES
        .iter()
        .find(|(p, _)| *p == param)
        .map(|(_, axis)| *axis)
}

/// `(param, code, name)` of a category filter link, skipping the "all" entry.
fn category_link(a: ElementRef<'_>) -> Option<(String, String, String)> {
    let href = a.value().attr("href")?;
    let caps = CATEGORY_PARAM.as_ref()?.captures(href)?;
    let name = text_of(a);
    if name.is_empty() || name == ALL_CATEGORIES {
        return None;
    }
    Some((caps[1].to_string(), caps[2].to_string(), name))
}

/// Category values of one recipe. The first link per axis wins. Pages
/// without a `div.view_cate` block are searched as a whole.
pub(crate) fn parse_categories(doc: &Html) -> Result<RecipeCategories> {
    let link_sel = selector("a[href]")?;
    let links: Vec<ElementRef<'_>> = match doc.select(&selector("div.view_cate")?).next() {
        Some(area) => area.select(&link_sel).collect(),
        None => doc.select(&link_sel).collect(),
    };

    let mut categories = RecipeCategories::default();
    for (param, _, name) in links.into_iter().filter_map(category_link) {
        let slot = match category_axis(&param) {
            Some("kind") => &mut categories.kind,
            Some("situation") => &mut categories.situation,
            Some("ingredient") => &mut categories.ingredient,
            Some("method") => &mut categories.method,
            _ => continue,
        };
        slot.get_or_insert(name);
    }
    Ok(categories)
}

/// Parse the category catalog from a listing page, deduplicated per axis.
pub(crate) fn parse_category_catalog(body: &str) -> Result<CategoryCatalog> {
    let doc = Html::parse_document(body);
    let mut catalog = CategoryCatalog::new();
    for (param, code, name) in doc.select(&selector("a[href]")?).filter_map(category_link) {
        let Some(axis) = category_axis(&param) else {
            continue;
        };
        let entries = catalog.entry(axis).or_default();
        let entry = CategoryEntry { code, name };
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    Ok(catalog)
}

/// Parse a listing page into item references, deduplicated in page order.
pub(crate) fn parse_listing(body: &str) -> Result<Vec<ItemRef>> {
    let doc = Html::parse_document(body);
    let card_sel = selector("li.common_sp_list_li")?;
    let link_sel = selector("a.common_sp_link")?;
    let title_sel = selector("div.common_sp_caption_tit")?;

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for card in doc.select(&card_sel) {
        let Some(id) = card
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(extract_recipe_id)
        else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        let title = card
            .select(&title_sel)
            .next()
            .map(text_of)
            .filter(|t| !t.is_empty());
        items.push(ItemRef { id, title });
    }
    Ok(items)
}

/// Parse a detail page into a [`RawRecord`].
pub(crate) fn parse_detail(id: &ItemId, url: &Url, body: &str) -> Result<RawRecord> {
    let doc = Html::parse_document(body);

    // Removed recipes are served as a 200 page without the summary block.
    let title = doc
        .select(&selector("div.view2_summary h3")?)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| LarderError::NotFound(format!("recipe {id}: no summary block")))?;

    let description = doc
        .select(&selector("div.view2_summary_info")?)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty());

    let name_sel = selector("div.ingre_list_name")?;
    let amount_sel = selector("span.ingre_list_ea")?;
    let ingredients = doc
        .select(&selector("div.ready_ingre3 li")?)
        .filter_map(|li| {
            let name = li.select(&name_sel).next().map(text_of)?;
            if name.is_empty() {
                return None;
            }
            let amount = li.select(&amount_sel).next().map(text_of).unwrap_or_default();
            Some(Ingredient { name, amount })
        })
        .collect();

    let body_sel = selector("div.media-body")?;
    let img_sel = selector("img")?;
    let mut steps = Vec::new();
    let mut step_images = Vec::new();
    for step in doc.select(&selector("div.view_step_cont")?) {
        let text = step.select(&body_sel).next().map(text_of).unwrap_or_default();
        if !text.is_empty() {
            steps.push(text);
        }
        if let Some(src) = step.select(&img_sel).next().and_then(|i| i.value().attr("src")) {
            step_images.push(clean_image_url(src));
        }
    }

    let mut asset_urls = Vec::new();
    if let Some(src) = doc
        .select(&selector("img#main_thumbs")?)
        .next()
        .and_then(|i| i.value().attr("src"))
        .filter(|s| !s.is_empty())
    {
        asset_urls.push(clean_image_url(src));
    }
    asset_urls.extend(step_images);
    let categories = parse_categories(&doc)?;

    Ok(RawRecord {
        schema_version: RAW_SCHEMA_VERSION,
        id: id.clone(),
        url: url.to_string(),
        title,
        description,
        ingredients,
        steps,
        asset_urls,
        categories,
        content_hash: compute_hash(body.as_bytes()),
        fetched_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = r#"<html><body><ul>
        <li class="common_sp_list_li">
          <a class="common_sp_link" href="/recipe/6912345">
            <div class="common_sp_thumb"><img src="https://img.example.com/a_m.jpg"></div>
          </a>
          <div class="common_sp_caption_tit">초간단 김치찌개 만들기</div>
        </li>
        <li class="common_sp_list_li">
          <a class="common_sp_link" href="/recipe/6912346"></a>
          <div class="common_sp_caption_tit">백종원의 된장찌개</div>
        </li>
        <li class="common_sp_list_li">
          <a class="common_sp_link" href="/recipe/6912345"></a>
        </li>
        <li class="common_sp_list_li">
          <a class="common_sp_link" href="/profile/chef"></a>
        </li>
    </ul></body></html>"#;

    const DETAIL: &str = r#"<html><body>
        <div class="view2_summary">
          <h3>초간단   김치찌개 만들기</h3>
          <div class="view2_summary_info">
            <span class="view2_summary_info1">2인분</span>
            <span class="view2_summary_info2">30분 이내</span>
            <span class="view2_summary_info3">초급</span>
          </div>
        </div>
        <img id="main_thumbs" src="https://recipe1.ezmember.co.kr/cache/recipe/main_m.jpg">
        <div class="ready_ingre3"><ul>
          <li><div class="ingre_list_name">김치</div><span class="ingre_list_ea">1/4포기</span></li>
          <li><div class="ingre_list_name">돼지고기</div></li>
        </ul></div>
        <div class="view_step_cont"><div class="media-body">김치를 썰어요.</div>
          <img src="https://recipe1.ezmember.co.kr/cache/recipe/step1_m.jpg"></div>
        <div class="view_step_cont"><div class="media-body">  </div></div>
        <div class="view_step_cont"><div class="media-body">끓여요.</div></div>
        <div class="view_cate">
          <a href="/recipe/list.html?cat4=56">찌개</a>
          <a href="/recipe/list.html?cat2=0">전체</a>
          <a href="/recipe/list.html?cat3=70">김치</a>
          <a href="/recipe/list.html?cat3=71">돼지고기</a>
        </div>
        <a href="/recipe/list.html?cat1=6">끓이기</a>
    </body></html>"#;

    const CATALOG: &str = r#"<html><body><div id="id_search_category">
        <a href="javascript:goSearchRecipe('cat4','')">전체</a>
        <a href="/recipe/list.html?cat4=63">밑반찬</a>
        <a href="/recipe/list.html?cat4=56">메인반찬</a>
        <a href="/recipe/list.html?cat4=63">밑반찬</a>
        <a href="/recipe/list.html?cat2=12">일상</a>
        <a href="/recipe/list.html?cat2=0">전체</a>
        <a href="/recipe/list.html?order=reco&cat1=6">끓이기</a>
        <a href="/recipe/list.html?page=2">2</a>
    </div></body></html>"#;

    fn source_for(server: &MockServer) -> HttpSource {
        let config = SourceConfig {
            base_url: server.uri(),
            ..SourceConfig::default()
        };
        HttpSource::new(&config).unwrap().allow_localhost()
    }

    #[test]
    fn recipe_id_extraction() {
        assert_eq!(extract_recipe_id("/recipe/6912345"), Some(ItemId::from("6912345")));
        assert_eq!(
            extract_recipe_id("https://www.10000recipe.com/recipe/42/"),
            Some(ItemId::from("42"))
        );
        assert_eq!(extract_recipe_id("/recipe/list.html"), None);
        assert_eq!(extract_recipe_id("/profile/abc"), None);
    }

    #[test]
    fn thumbnail_suffix_is_stripped() {
        assert_eq!(
            clean_image_url("https://img.example.com/cache/abc_m.jpg"),
            "https://img.example.com/cache/abc.jpg"
        );
        assert_eq!(
            clean_image_url("https://img.example.com/cache/abc.png"),
            "https://img.example.com/cache/abc.png"
        );
    }

    #[test]
    fn listing_is_deduplicated() {
        let items = parse_listing(LISTING).unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["6912345", "6912346"]);
        assert_eq!(items[0].title.as_deref(), Some("초간단 김치찌개 만들기"));
    }

    #[test]
    fn detail_extraction() {
        let url = Url::parse("https://www.10000recipe.com/recipe/6912345").unwrap();
        let raw = parse_detail(&"6912345".into(), &url, DETAIL).unwrap();

        assert_eq!(raw.title, "초간단 김치찌개 만들기");
        assert_eq!(raw.description.as_deref(), Some("2인분 30분 이내 초급"));
        assert_eq!(raw.ingredients.len(), 2);
        assert_eq!(raw.ingredients[1].amount, "");
        assert_eq!(raw.steps, vec!["김치를 썰어요.", "끓여요."]);
        assert_eq!(
            raw.asset_urls,
            vec![
                "https://recipe1.ezmember.co.kr/cache/recipe/main.jpg",
                "https://recipe1.ezmember.co.kr/cache/recipe/step1.jpg",
            ]
        );
        assert_eq!(raw.content_hash.len(), 64);

        // Only the view_cate block counts once it exists
        assert_eq!(raw.categories.kind.as_deref(), Some("찌개"));
        assert_eq!(raw.categories.ingredient.as_deref(), Some("김치"));
        assert_eq!(raw.categories.situation, None);
        assert_eq!(raw.categories.method, None);
    }

    #[test]
    fn categories_fall_back_to_whole_page() {
        let doc = Html::parse_document(
            r#"<a href="/recipe/list.html?cat1=6">끓이기</a><a href="?cat2=12">일상</a>"#,
        );
        let categories = parse_categories(&doc).unwrap();
        assert_eq!(categories.method.as_deref(), Some("끓이기"));
        assert_eq!(categories.situation.as_deref(), Some("일상"));
        assert_eq!(categories.kind, None);
    }

    #[test]
    fn category_catalog_is_grouped_and_deduplicated() {
        let catalog = parse_category_catalog(CATALOG).unwrap();
        let names = |axis: &str| -> Vec<&str> {
            catalog[axis].iter().map(|e| e.name.as_str()).collect()
        };
        assert_eq!(names("kind"), vec!["밑반찬", "메인반찬"]);
        assert_eq!(catalog["kind"][0].code, "63");
        assert_eq!(names("situation"), vec!["일상"]);
        assert_eq!(names("method"), vec!["끓이기"]);
        assert!(!catalog.contains_key("ingredient"));
    }

    #[test]
    fn detail_without_summary_is_not_found() {
        let url = Url::parse("https://www.10000recipe.com/recipe/1").unwrap();
        let err = parse_detail(&"1".into(), &url, "<html><body></body></html>").unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn fetch_page_from_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/recipe/list.html"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/recipe/list.html"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let source = source_for(&server);
        assert_eq!(source.fetch_page(1).await.unwrap().len(), 2);
        assert!(source.fetch_page(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_detail_maps_statuses() {
        let server = MockServer::start().await;
        Mock::given(path("/recipe/6912345"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL))
            .mount(&server)
            .await;
        Mock::given(path("/recipe/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/recipe/429"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let source = source_for(&server);
        let raw = source.fetch_detail(&"6912345".into()).await.unwrap();
        assert_eq!(raw.steps.len(), 2);
        assert!(raw.url.ends_with("/recipe/6912345"));

        let err = source.fetch_detail(&"404".into()).await.unwrap_err();
        assert!(err.is_not_found());

        let err = source.fetch_detail(&"429".into()).await.unwrap_err();
        assert!(matches!(err, LarderError::RateLimited(_)));
    }

    #[tokio::test]
    async fn fetch_categories_from_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/recipe/list.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CATALOG))
            .mount(&server)
            .await;

        let catalog = source_for(&server).fetch_categories().await.unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog["situation"][0].code, "12");
    }

    #[tokio::test]
    async fn localhost_blocked_without_opt_in() {
        let server = MockServer::start().await;
        let config = SourceConfig {
            base_url: server.uri(),
            ..SourceConfig::default()
        };
        let source = HttpSource::new(&config).unwrap();
        let err = source.fetch_page(1).await.unwrap_err();
        assert!(matches!(err, LarderError::Validation { .. }));
    }
}
