//! Per-owner reconciliation: fetch, classify, normalize, gate, describe, persist.

use crate::balance::{BalanceGate, describe_balance};
use crate::llm::DescriptionGenerator;
use crate::models::{CanonicalListing, InsertedListing, Owner, RecordId};
use crate::normalize::{
    Lookup, classify_property_type, find_value, format_price, list_mentions, mentions, normalize_parking,
    parse_bathrooms, parse_leading_int, parse_number, round_area,
};
use crate::notify::{Notifier, escape_html};
use crate::photo_service::{PhotoProvider, PhotoReport};
use crate::photos::{MAIN_PHOTO_INDEX, merge_photos, photo_slots, photo_urls};
use crate::scraper::{ListingSource, extract_item, remote_status};
use crate::store::ListingStore;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_AGENT_ID: i64 = 132_466_118;
const WITHDRAWN_STATUS: &str = "unpublished";
/// Prepayment published for every listing, whatever the source states.
const FIXED_PREPAYMENT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub agent_id: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID,
        }
    }
}

/// What happened to an owner that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerOutcome {
    Published {
        listing_id: Option<RecordId>,
        external_id: Option<RecordId>,
    },
    /// The source no longer publishes the listing; both records were removed.
    Withdrawn,
    /// Nothing to fetch: the owner has no URL.
    Skipped,
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn ListingStore>,
    source: Arc<dyn ListingSource>,
    photos: Option<Arc<dyn PhotoProvider>>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<BalanceGate>,
    describer: Arc<DescriptionGenerator>,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ListingStore>,
        source: Arc<dyn ListingSource>,
        notifier: Arc<dyn Notifier>,
        gate: Arc<BalanceGate>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            source,
            photos: None,
            notifier,
            gate,
            describer: Arc::new(DescriptionGenerator::disabled()),
            config: Arc::new(config),
        }
    }

    pub fn with_photos(mut self, provider: Option<Arc<dyn PhotoProvider>>) -> Self {
        self.photos = provider;
        self
    }

    pub fn with_describer(mut self, describer: DescriptionGenerator) -> Self {
        self.describer = Arc::new(describer);
        self
    }

    pub fn store(&self) -> &dyn ListingStore {
        self.store.as_ref()
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub fn gate(&self) -> &BalanceGate {
        &self.gate
    }

    /// Drives one owner to a terminal state.
    ///
    /// On error the owner is left unparsed so the next cycle picks it up again.
    pub async fn process_owner(&self, owner: &Owner) -> Result<OwnerOutcome, PipelineError> {
        let Some(url) = owner.source_url() else {
            info!(target = "reconciler.pipeline", owner_id = %owner.id, "owner_without_url");
            self.notifier
                .log(&format!(
                    "У записи owners {} отсутствует url",
                    escape_html(&owner.id.to_string())
                ))
                .await;
            return Ok(OwnerOutcome::Skipped);
        };

        let payload = self
            .timed("scrape", async {
                self.source.fetch(url).await.map_err(|err| {
                    PipelineError::transport("scrape", format!("scraper did not respond ({err})"))
                })
            })
            .await?;
        let item = extract_item(&payload).ok_or_else(|| {
            PipelineError::data_shape("extract", "scraper returned an empty item")
        })?;

        if remote_status(&payload, item) == WITHDRAWN_STATUS {
            self.withdraw(owner, url).await?;
            return Ok(OwnerOutcome::Withdrawn);
        }

        let primary_photos = photo_urls(find_value(item, "photos").value());
        let report = self.timed("photos", self.photo_report(url)).await?;
        self.gate
            .check(report.balance, self.notifier.as_ref())
            .await
            .map_err(|blocked| PipelineError::blocked("balance", blocked.to_string()))?;
        let photos = merge_photos(&primary_photos, &report.photos);

        let description = self
            .timed("describe", async {
                Ok(self
                    .describer
                    .generate(item, Some(url), self.notifier.as_ref())
                    .await)
            })
            .await?;
        let listing = build_listing(owner, url, item, &photos, description, self.config.agent_id);

        let inserted = self
            .timed("persist", async {
                self.store.insert_listing(&listing).await.map_err(|err| {
                    PipelineError::persistence("persist", format!("listing insert failed ({err})"))
                })
            })
            .await?;
        self.store
            .mark_owner_parsed(&owner.id)
            .await
            .map_err(|err| {
                PipelineError::persistence("mark_parsed", format!("owner update failed ({err})"))
            })?;

        self.announce(owner, url, &listing, &inserted).await;
        Ok(OwnerOutcome::Published {
            listing_id: inserted.id,
            external_id: inserted.external_id,
        })
    }

    async fn photo_report(&self, url: &str) -> Result<PhotoReport, PipelineError> {
        let Some(provider) = &self.photos else {
            return Ok(PhotoReport::default());
        };
        let report = provider.photos_for(url).await.map_err(|err| {
            PipelineError::transport("photos", format!("photo service did not respond ({err})"))
        })?;
        if let Some(fault) = &report.fault {
            self.notifier
                .log(&format!(
                    "Фотосервис ошибка {}: {}",
                    escape_html(&fault.code),
                    escape_html(&fault.text)
                ))
                .await;
        }
        Ok(report)
    }

    async fn withdraw(&self, owner: &Owner, url: &str) -> Result<(), PipelineError> {
        self.store
            .delete_listing_by_source(url)
            .await
            .map_err(|err| {
                PipelineError::persistence("withdraw", format!("listing delete failed ({err})"))
            })?;
        self.store.delete_owner(&owner.id).await.map_err(|err| {
            PipelineError::persistence("withdraw", format!("owner delete failed ({err})"))
        })?;
        info!(target = "reconciler.pipeline", owner_id = %owner.id, url, "listing_withdrawn");
        self.notifier
            .log(&format!(
                "⚠️ <b>Объявление {} было снято с публикации</b>\nowners id: {} — запись удалена",
                escape_html(url),
                escape_html(&owner.id.to_string())
            ))
            .await;
        Ok(())
    }

    async fn announce(
        &self,
        owner: &Owner,
        url: &str,
        listing: &CanonicalListing,
        inserted: &InsertedListing,
    ) {
        let listing_id = display_id(inserted.id.as_ref());
        let external_id = display_id(inserted.external_id.as_ref());
        info!(
            target = "reconciler.pipeline",
            owner_id = %owner.id,
            listing_id = %listing_id,
            external_id = %external_id,
            "listing_published"
        );

        let success = [
            "✅ Объявление обработано".to_string(),
            format!("owners: {}", escape_html(&owner.id.to_string())),
            format!(
                "objects: {} (external: {})",
                escape_html(&listing_id),
                escape_html(&external_id)
            ),
            format!(
                "Баланс фотосервиса: {}",
                describe_balance(self.gate.last_observed_balance())
            ),
        ]
        .join("\n");
        self.notifier.log(&success).await;

        let price = match listing.price.filter(|price| *price != 0.0) {
            Some(price) => format_price(Some(price)),
            None => "Не указана".to_string(),
        };
        let status = [
            "🆕 <b>Новый объект в процессе публикации</b>".to_string(),
            String::new(),
            format!("📄 <b>Объявление №{}</b>", escape_html(&external_id)),
            format!("📍 <b>Адрес:</b> {}", escape_html(&listing.address)),
            format!("💰 <b>Цена:</b> {price}"),
            format!(
                "🔗 <b>Ссылка:</b> <a href=\"{}\">Открыть объявление</a>",
                escape_html(url)
            ),
        ]
        .join("\n");
        self.notifier.status(&status).await;
    }

    async fn timed<T, Fut>(&self, name: &'static str, fut: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        if let Err(err) = &outcome {
            warn!(
                target = "reconciler.pipeline",
                stage = name,
                kind = ?err.kind(),
                error = %err.detail(),
                "stage_failed"
            );
        }
        outcome
    }
}

/// Canonical record for `item`, including the fixed publication defaults.
fn build_listing(
    owner: &Owner,
    url: &str,
    item: &Value,
    photos: &[String],
    description: String,
    agent_id: i64,
) -> CanonicalListing {
    let field = |key: &str| find_value(item, key);
    let bathroom = field("bathroom").value();
    let counts = parse_bathrooms(&field("bathroom").text().unwrap_or_default());
    let slots = photo_slots(photos, MAIN_PHOTO_INDEX);

    CanonicalListing {
        owners_id: owner.id.clone(),
        address: field("address").text().unwrap_or_else(|| url.to_string()),
        description,
        floor: nonzero(parse_leading_int(field("floor").value())),
        total_floors: nonzero(parse_leading_int(field("floors_total").value())),
        rooms: nonzero(parse_leading_int(
            field("rooms").or(field("rooms_count")).value(),
        )),
        agent_id,
        main_photo_index: MAIN_PHOTO_INDEX,
        main_photo_url: slots.main,
        photos_json: slots.secondary,
        complex_name: field("jk").text().or_else(|| field("complex").text()),
        promotion_type: "noPromotion",
        promotion_bet: None,
        price: parse_number(field("price").value()),
        deposit: parse_number(field("payment_deposit").or(field("deposit")).value()),
        prepayment: resolve_prepayment(parse_number(
            field("payment_prepay").or(field("prepayment")).value(),
        )),
        conditioner: list_mentions(field("amenities").value(), "кондиционер"),
        bathtub: mentions(bathroom, "ванн"),
        shower: mentions(bathroom, "душ"),
        total_area: round_area(field("total_area").value()),
        living_area: round_area(field("living_area").value()),
        kitchen_area: round_area(field("kitchen_area").value()),
        combined_bathroom: counts.combined,
        separate_bathroom: counts.separate,
        balconies: count_or_zero(field("balcony_count").or(field("balconies"))),
        loggias: count_or_zero(field("loggia_count").or(field("loggias"))),
        ceiling_height: nonzero(parse_leading_int(field("ceiling_height").value())),
        parking: normalize_parking(field("parking").value()),
        status: "draft",
        property_type: classify_property_type(field("object_type").or(field("summary")).value()),
        cian_url: url.to_string(),
        children: true,
        pets: true,
        layout: "Смежно-Изолированная",
        repair: "Дизайнерский",
        windowtype: "На улицу и двор",
        termtype: "От года",
        utilites: "включена (без счётчиков)",
        fridge: true,
        washer: true,
        tv: true,
        internet: true,
        furniture: true,
        kitchenfurniture: true,
        passenger_elevator: 1,
        freight_elevator: 1,
        category: "flatRent",
    }
}

/// The scraped prepayment is read but never published.
fn resolve_prepayment(scraped: Option<f64>) -> f64 {
    if let Some(scraped) = scraped.filter(|value| *value != FIXED_PREPAYMENT) {
        debug!(target = "reconciler.pipeline", scraped, "prepayment_overridden");
    }
    FIXED_PREPAYMENT
}

fn nonzero(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v != 0)
}

/// Absent counts read as zero; present but unparseable ones as unknown.
fn count_or_zero(lookup: Lookup<'_>) -> Option<i64> {
    match lookup.value() {
        Some(value) => parse_leading_int(Some(value)),
        None => Some(0),
    }
}

fn display_id(id: Option<&RecordId>) -> String {
    id.map(ToString::to_string)
        .unwrap_or_else(|| "—".to_string())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// A remote service was unreachable or answered non-2xx.
    Transport,
    /// The scraper answered without an extractable listing.
    DataShape,
    /// Publication is paused on the photo-service balance.
    Blocked,
    Persistence,
}

impl PipelineError {
    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn transport(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Transport)
    }

    pub fn data_shape(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::DataShape)
    }

    pub fn blocked(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Blocked)
    }

    pub fn persistence(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Persistence)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}
