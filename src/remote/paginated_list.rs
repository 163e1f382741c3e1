//! One page of a collection plus its position in the whole.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Page metadata. `current_page` is 1-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
  pub elements_per_page: u32,
  pub total_elements: u64,
  pub total_pages: u32,
  pub current_page: u32,
}

/// Page block of a HAL collection document, as sent on the wire.
#[derive(Debug, Deserialize)]
struct ApiPage {
  #[serde(default)]
  size: u32,
  #[serde(rename = "totalElements", default)]
  total_elements: u64,
  #[serde(rename = "totalPages", default)]
  total_pages: u32,
  /// 0-based
  #[serde(default)]
  number: u32,
}

impl From<ApiPage> for PageInfo {
  fn from(page: ApiPage) -> Self {
    Self {
      elements_per_page: page.size,
      total_elements: page.total_elements,
      total_pages: page.total_pages,
      current_page: page.number + 1,
    }
  }
}

/// A page of items in server order, possibly empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedList<T> {
  pub page_info: PageInfo,
  pub page: Vec<T>,
}

impl<T> PaginatedList<T> {
  pub fn new(page_info: PageInfo, page: Vec<T>) -> Self {
    Self { page_info, page }
  }

  pub fn len(&self) -> usize {
    self.page.len()
  }

  pub fn is_empty(&self) -> bool {
    self.page.is_empty()
  }

  pub fn is_last_page(&self) -> bool {
    self.page_info.current_page >= self.page_info.total_pages
  }
}

impl<T: DeserializeOwned> PaginatedList<T> {
  /// Decode a HAL collection document.
  ///
  /// The items are the first array found under `_embedded`; a document
  /// without `_embedded` is an empty page. A missing `page` block describes a
  /// single page holding every item.
  pub fn from_hal(document: &Value) -> Result<Self> {
    let items = document
      .get("_embedded")
      .and_then(Value::as_object)
      .and_then(|embedded| embedded.values().find_map(Value::as_array));

    let page = match items {
      Some(items) => items
        .iter()
        .map(|item| {
          serde_json::from_value(item.clone())
            .map_err(|e| eyre!("Failed to decode list item: {}", e))
        })
        .collect::<Result<Vec<T>>>()?,
      None => Vec::new(),
    };

    let page_info = match document.get("page") {
      Some(raw) => {
        let api: ApiPage = serde_json::from_value(raw.clone())
          .map_err(|e| eyre!("Failed to decode page info: {}", e))?;
        api.into()
      }
      None => PageInfo {
        elements_per_page: page.len() as u32,
        total_elements: page.len() as u64,
        total_pages: 1,
        current_page: 1,
      },
    };

    if page.len() > page_info.elements_per_page as usize && document.get("page").is_some() {
      return Err(eyre!(
        "Page holds {} items but declares a page size of {}",
        page.len(),
        page_info.elements_per_page
      ));
    }

    Ok(Self { page_info, page })
  }
}
