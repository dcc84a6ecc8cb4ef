//! ユーザーのタイムゾーンの解決と、選択ダイアログ用の一覧。

use std::collections::BTreeMap;

use chrono_tz::{TZ_VARIANTS, Tz};

use super::event::UserId;
use super::store::{DiaryStore, StoreError};

/// 地理的な地域として扱う IANA 名の先頭部分
const REGIONS: [&str; 9] = [
    "Africa",
    "America",
    "Antarctica",
    "Asia",
    "Atlantic",
    "Australia",
    "Europe",
    "Indian",
    "Pacific",
];

/// 地域ごとにまとめたタイムゾーン一覧。
#[derive(Debug, Clone)]
pub struct TimezoneCatalog {
    /// 地域 -> 都市名（ソート済み）
    regions: BTreeMap<String, Vec<String>>,
}

impl TimezoneCatalog {
    pub fn new() -> Self {
        let mut regions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tz in TZ_VARIANTS.iter() {
            // `America/Kentucky/Louisville` のように 3 階層の名前もある
            let Some((region, city)) = tz.name().split_once('/') else {
                continue;
            };
            if REGIONS.contains(&region) {
                regions
                    .entry(region.to_string())
                    .or_default()
                    .push(city.to_string());
            }
        }
        for cities in regions.values_mut() {
            cities.sort();
        }
        Self { regions }
    }

    pub fn continents(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    pub fn cities(&self, continent: &str) -> Option<&[String]> {
        self.regions.get(continent).map(Vec::as_slice)
    }

    /// 地域と都市の組み合わせをタイムゾーンに変換する。
    pub fn resolve(&self, continent: &str, city: &str) -> Option<Tz> {
        let cities = self.cities(continent)?;
        if !cities.iter().any(|c| c == city) {
            return None;
        }
        format!("{continent}/{city}").parse().ok()
    }
}

impl Default for TimezoneCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// ストアに保存されたタイムゾーンを読み書きする。
pub struct TimezoneResolver<'a> {
    store: &'a dyn DiaryStore,
    default: Tz,
}

impl<'a> TimezoneResolver<'a> {
    pub fn new(store: &'a dyn DiaryStore, default: Tz) -> Self {
        Self { store, default }
    }

    /// 未設定の場合はデフォルトのタイムゾーンを返す。
    pub async fn get_timezone(&self, user: UserId) -> Result<Tz, StoreError> {
        let Some(name) = self.store.timezone(user).await? else {
            return Ok(self.default);
        };
        match name.parse::<Tz>() {
            Ok(tz) => Ok(tz),
            Err(e) => {
                tracing::warn!(user_id = user, timezone = %name, error = %e, "Unknown stored timezone, using default");
                Ok(self.default)
            }
        }
    }

    pub async fn set_timezone(&self, user: UserId, tz: Tz) -> Result<(), StoreError> {
        self.store.set_timezone(user, tz.name()).await
    }
}
