use eframe::egui;
use egui::{Color32, CornerRadius, RichText, ScrollArea, Sense, Stroke, Ui, ViewportBuilder};
use image::ImageReader;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod api_client;
mod config;
mod db;
mod geo;
mod history;
mod lookup;
mod models;

use crate::api_client::{ApiError, ApiResult, InfomapClient};
use crate::config::{CONFIG, DEFAULT_MAX_QUOTA, SESSION_STORAGE_KEY};
use crate::db::LocalStore;
use crate::geo::CountryShape;
use crate::history::{HistoryCache, SystemClock};
use crate::lookup::{CountryLookup, LookupEvent, LookupStart};
use crate::models::{
    AdminUser, AuthStatus, CountryStats, LookupKey, LookupRecord, NewUserRequest, NewsItem, Quota,
    QuotaUpdate, StatusUpdate, TimeFilter, Topic,
};

// Function to load an image as an icon
fn load_icon(path: &str) -> Result<egui::IconData, Box<dyn std::error::Error>> {
    let img = ImageReader::open(path)?.decode()?;
    let rgba_image = img.into_rgba8();
    let (width, height) = rgba_image.dimensions();

    Ok(egui::IconData {
        rgba: rgba_image.into_raw(),
        width,
        height,
    })
}

fn auth_failure_message(error: &ApiError) -> String {
    if error.is_unreachable() {
        error.to_string()
    } else {
        format!("Could not verify session: {}", error)
    }
}

fn main() -> Result<(), eframe::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let icon_data = match load_icon("logo/logo.png") {
        Ok(icon) => Some(icon),
        Err(e) => {
            log::warn!("Failed to load icon: {}", e);
            None
        }
    };

    let mut options = eframe::NativeOptions {
        viewport: ViewportBuilder::default()
            .with_inner_size([1400.0, 860.0])
            .with_min_inner_size([960.0, 600.0])
            .with_title("InfoMap"),
        ..Default::default()
    };

    if let Some(icon) = icon_data {
        options.viewport.icon = Some(Arc::new(icon));
    }

    log::info!("Using API at {}", CONFIG.api_base);

    eframe::run_native(
        "InfoMap",
        options,
        Box::new(|cc| {
            let mut app = InfomapApp::new()?;

            if let Some(storage) = cc.storage {
                if let Some(theme_str) = storage.get_string("is_dark_mode") {
                    if let Ok(is_dark_mode) = theme_str.parse::<bool>() {
                        app.is_dark_mode = is_dark_mode;
                        app.theme = if is_dark_mode { AppTheme::dark() } else { AppTheme::light() };
                    }
                }
            }

            Ok(Box::new(app))
        }),
    )
}

struct AppTheme {
    background: Color32,
    card_background: Color32,
    text: Color32,
    secondary_text: Color32,
    highlight: Color32,
    accent: Color32,
    error: Color32,
    separator: Color32,
    ocean: Color32,
    country_stroke: Color32,
    visited_stroke: Color32,
    button_background: Color32,
    button_foreground: Color32,
    button_active_background: Color32,
    button_hover_background: Color32,
}

impl AppTheme {
    fn dark() -> Self {
        Self {
            background: Color32::from_rgb(0, 0, 0),
            card_background: Color32::from_rgb(13, 17, 23),
            text: Color32::from_rgb(240, 240, 240),
            secondary_text: Color32::from_rgb(140, 148, 158),
            highlight: Color32::from_rgb(234, 88, 12),      // Orange
            accent: Color32::from_rgb(59, 130, 246),        // Blue
            error: Color32::from_rgb(248, 113, 113),
            separator: Color32::from_rgb(48, 54, 61),
            ocean: Color32::from_rgb(6, 10, 20),
            country_stroke: Color32::from_rgb(59, 130, 246),
            visited_stroke: Color32::from_rgb(251, 146, 60),
            button_background: Color32::from_rgb(22, 27, 34),
            button_foreground: Color32::from_rgb(230, 230, 230),
            button_active_background: Color32::from_rgb(234, 88, 12),
            button_hover_background: Color32::from_rgb(33, 38, 45),
        }
    }

    fn light() -> Self {
        Self {
            background: Color32::from_rgb(245, 245, 245),
            card_background: Color32::from_rgb(255, 255, 255),
            text: Color32::from_rgb(20, 20, 20),
            secondary_text: Color32::from_rgb(90, 90, 90),
            highlight: Color32::from_rgb(214, 80, 10),
            accent: Color32::from_rgb(29, 78, 216),
            error: Color32::from_rgb(200, 30, 30),
            separator: Color32::from_rgb(200, 200, 200),
            ocean: Color32::from_rgb(225, 235, 245),
            country_stroke: Color32::from_rgb(29, 78, 216),
            visited_stroke: Color32::from_rgb(214, 80, 10),
            button_background: Color32::from_rgb(235, 235, 235),
            button_foreground: Color32::from_rgb(20, 20, 20),
            button_active_background: Color32::from_rgb(214, 80, 10),
            button_hover_background: Color32::from_rgb(210, 210, 210),
        }
    }

    fn apply_to_ctx(&self, ctx: &egui::Context) {
        let mut style = (*ctx.style()).clone();

        style.visuals.panel_fill = self.background;
        style.visuals.window_fill = self.card_background;
        style.visuals.window_stroke = Stroke::new(1.0, self.separator);
        style.visuals.widgets.noninteractive.bg_fill = self.card_background;
        style.visuals.widgets.noninteractive.fg_stroke = Stroke::new(1.0, self.text);

        style.visuals.widgets.inactive.bg_fill = self.button_background;
        style.visuals.widgets.inactive.fg_stroke = Stroke::new(1.0, self.button_foreground);
        style.visuals.widgets.active.bg_fill = self.button_active_background;
        style.visuals.widgets.active.fg_stroke = Stroke::new(1.0, self.button_foreground);
        style.visuals.widgets.hovered.bg_fill = self.button_hover_background;
        style.visuals.widgets.hovered.fg_stroke = Stroke::new(1.0, self.button_foreground);

        style.visuals.selection.bg_fill = self.highlight;
        style.visuals.selection.stroke = Stroke::new(1.0, self.highlight);

        style.visuals.window_corner_radius = CornerRadius::same(12);
        style.visuals.menu_corner_radius = CornerRadius::same(6);
        style.visuals.widgets.noninteractive.corner_radius = CornerRadius::same(4);
        style.visuals.widgets.inactive.corner_radius = CornerRadius::same(6);
        style.visuals.widgets.hovered.corner_radius = CornerRadius::same(6);
        style.visuals.widgets.active.corner_radius = CornerRadius::same(6);

        style.visuals.window_shadow = egui::epaint::Shadow {
            offset: [2, 2],
            blur: 10,
            spread: 1,
            color: Color32::from_rgba_premultiplied(0, 0, 0, 40),
        };

        ctx.set_style(style);
    }
}

/// Work running on a background thread, polled once per frame.
struct Task<T> {
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Task<T> {
    fn spawn(job: impl FnOnce() -> T + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(job());
        });
        Self { receiver: rx }
    }

    /// Takes the result out of `slot` once the job has finished
    fn poll(slot: &mut Option<Task<T>>) -> Option<T> {
        let task = slot.as_ref()?;
        match task.receiver.try_recv() {
            Ok(value) => {
                *slot = None;
                Some(value)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                *slot = None;
                None
            }
        }
    }
}

enum AuthState {
    Checking,
    SignedOut,
    SignedIn(AuthStatus),
}

#[derive(Default)]
struct AdminPanel {
    open: bool,
    users: Vec<AdminUser>,
    loading: bool,
    message: Option<String>,
    // Pending quota edits, keyed by email
    quota_edits: HashMap<String, u32>,
    new_email: String,
    new_is_admin: bool,
    new_quota: u32,
    users_task: Option<Task<ApiResult<Vec<AdminUser>>>>,
    action_task: Option<Task<(String, ApiResult<()>)>>,
}

struct InfomapApp {
    client: InfomapClient,
    store: LocalStore,
    history: HistoryCache,
    lookup: CountryLookup,
    theme: AppTheme,
    is_dark_mode: bool,
    // Session
    auth: AuthState,
    auth_task: Option<Task<ApiResult<AuthStatus>>>,
    logout_task: Option<Task<ApiResult<()>>>,
    session_input: String,
    login_message: Option<String>,
    login_started_at: Option<f64>,
    // Quota HUD
    quota_used: u32,
    quota_max: u32,
    quota_task: Option<Task<ApiResult<Option<Quota>>>>,
    server_history_task: Option<Task<ApiResult<Vec<LookupRecord>>>>,
    // Map
    countries: Vec<CountryShape>,
    country_names: Vec<String>,
    map_task: Option<Task<anyhow::Result<Vec<CountryShape>>>>,
    country_query: String,
    // Current lookup
    selected_country: Option<String>,
    time_filter: TimeFilter,
    topic: Topic,
    news: Vec<NewsItem>,
    country_stats: Option<CountryStats>,
    error: Option<String>,
    // Errors that make the main view unusable
    fatal_error: Option<String>,
    history_query: String,
    admin: AdminPanel,
}

impl InfomapApp {
    fn new() -> anyhow::Result<Self> {
        let store = match LocalStore::new() {
            Ok(store) => store,
            Err(e) => {
                log::error!("Failed to open local storage, history will not be kept: {}", e);
                LocalStore::in_memory()?
            }
        };

        let mut history = HistoryCache::load(store.clone(), Arc::new(SystemClock));
        history.purge_expired();

        let client = InfomapClient::new(&CONFIG.api_base)?;
        match store.get_item(SESSION_STORAGE_KEY) {
            Ok(session) => client.set_session(session),
            Err(e) => log::warn!("Failed to read saved session: {}", e),
        }

        let lookup = CountryLookup::new(Arc::new(client.clone()));

        let mut app = Self {
            client,
            store,
            history,
            lookup,
            theme: AppTheme::dark(),
            is_dark_mode: true,
            auth: AuthState::Checking,
            auth_task: None,
            logout_task: None,
            session_input: String::new(),
            login_message: None,
            login_started_at: None,
            quota_used: 0,
            quota_max: DEFAULT_MAX_QUOTA,
            quota_task: None,
            server_history_task: None,
            countries: Vec::new(),
            country_names: Vec::new(),
            map_task: None,
            country_query: String::new(),
            selected_country: None,
            time_filter: TimeFilter::default(),
            topic: Topic::default(),
            news: Vec::new(),
            country_stats: None,
            error: None,
            fatal_error: None,
            history_query: String::new(),
            admin: AdminPanel {
                new_quota: DEFAULT_MAX_QUOTA,
                ..Default::default()
            },
        };

        app.check_auth();
        Ok(app)
    }

    fn check_auth(&mut self) {
        self.auth = AuthState::Checking;
        let client = self.client.clone();
        self.auth_task = Some(Task::spawn(move || client.fetch_me()));
    }

    /// Startup work of the main view: quota, server history, map data
    fn enter_main_view(&mut self) {
        let client = self.client.clone();
        self.quota_task = Some(Task::spawn(move || client.fetch_quota()));

        let client = self.client.clone();
        self.server_history_task = Some(Task::spawn(move || client.fetch_history()));

        if self.countries.is_empty() && self.map_task.is_none() {
            let client = self.client.clone();
            let url = CONFIG.geojson_url.clone();
            self.map_task = Some(Task::spawn(move || {
                let body = client.fetch_text(&url)?;
                geo::parse_countries(&body)
            }));
        }
    }

    fn reload(&mut self) {
        self.fatal_error = None;
        self.error = None;
        self.check_auth();
    }

    fn is_busy(&self) -> bool {
        self.auth_task.is_some()
            || self.logout_task.is_some()
            || self.quota_task.is_some()
            || self.server_history_task.is_some()
            || self.map_task.is_some()
            || self.lookup.is_loading()
            || self.admin.users_task.is_some()
            || self.admin.action_task.is_some()
    }

    fn poll_tasks(&mut self) {
        if let Some(result) = Task::poll(&mut self.auth_task) {
            match result {
                Ok(status) if status.authenticated => {
                    log::info!(
                        "Signed in as {}",
                        status.user.as_ref().map(|u| u.email.as_str()).unwrap_or("unknown user")
                    );
                    self.login_message = None;
                    self.auth = AuthState::SignedIn(status);
                    self.enter_main_view();
                }
                Ok(_) => {
                    if self.client.has_session() {
                        self.login_message = Some("Session not accepted by the server".to_string());
                    }
                    self.auth = AuthState::SignedOut;
                }
                Err(e) => {
                    log::error!("Auth check failed: {}", e);
                    self.login_message = Some(auth_failure_message(&e));
                    self.auth = AuthState::SignedOut;
                }
            }
        }

        if let Some(result) = Task::poll(&mut self.logout_task) {
            if let Err(e) = result {
                log::warn!("Logout request failed: {}", e);
            }
            self.forget_session();
            self.auth = AuthState::SignedOut;
        }

        if let Some(result) = Task::poll(&mut self.quota_task) {
            match result {
                Ok(Some(quota)) => {
                    self.quota_used = quota.count;
                    self.quota_max = quota.max;
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("Could not fetch quota: {}", e);
                    self.fatal_error = Some(format!("Backend connection error: {}", e));
                }
            }
        }

        if let Some(result) = Task::poll(&mut self.server_history_task) {
            match result {
                Ok(records) => self.history.merge_server_history(records),
                Err(e) => log::error!("Could not fetch server history: {}", e),
            }
        }

        if let Some(result) = Task::poll(&mut self.map_task) {
            match result {
                Ok(countries) => {
                    self.country_names = geo::country_names(&countries);
                    self.countries = countries;
                }
                Err(e) => {
                    log::error!("Error loading GeoJSON: {}", e);
                    self.fatal_error =
                        Some("Map data error: could not load country boundaries.".to_string());
                }
            }
        }

        if let Some(event) = self.lookup.poll(&mut self.history) {
            match event {
                LookupEvent::Loaded { record, quota } => {
                    self.news = record.news_items;
                    self.country_stats = record.country_stats;
                    if let Some(used) = quota {
                        self.quota_used = used;
                    }
                }
                LookupEvent::Failed { key, message } => {
                    if self.selected_country.as_deref() == Some(key.country.as_str()) {
                        self.error = Some(message);
                    } else {
                        log::debug!("Dropping error for deselected country {}", key.country);
                    }
                }
            }
        }

        self.poll_admin_tasks();
    }

    fn select_country(&mut self, country: &str) {
        if country.is_empty() {
            return;
        }

        if self.selected_country.as_deref() != Some(country) {
            self.news.clear();
            self.country_stats = None;
        }
        self.selected_country = Some(country.to_string());
        self.fetch_news();
    }

    /// Shows the selected country with the current filters, from the cache
    /// when possible
    fn fetch_news(&mut self) {
        let Some(country) = self.selected_country.clone() else {
            return;
        };

        let key = LookupKey::new(country, self.time_filter, self.topic);
        match self.lookup.start(key, &mut self.history) {
            LookupStart::Hit(record) => {
                self.news = record.news_items;
                self.country_stats = record.country_stats;
                self.error = None;
            }
            LookupStart::Started => {
                self.error = None;
            }
            LookupStart::AlreadyLoading => {}
        }
    }

    fn restore_from_history(&mut self, record: LookupRecord) {
        self.lookup.cancel();
        self.selected_country = Some(record.country);
        self.time_filter = record.time_filter;
        self.topic = record.topic;
        self.news = record.news_items;
        self.country_stats = record.country_stats;
        self.error = None;
    }

    fn close_country(&mut self) {
        self.lookup.cancel();
        self.selected_country = None;
        self.error = None;
    }

    fn connect_with_session(&mut self) {
        let session = self.session_input.trim().to_string();
        if session.is_empty() {
            self.login_message = Some("Paste the session cookie first".to_string());
            return;
        }

        if let Err(e) = self.store.set_item(SESSION_STORAGE_KEY, &session) {
            log::warn!("Failed to save session: {}", e);
        }
        self.client.set_session(Some(session));
        self.session_input.clear();
        self.check_auth();
    }

    fn forget_session(&mut self) {
        self.client.set_session(None);
        if let Err(e) = self.store.remove_item(SESSION_STORAGE_KEY) {
            log::warn!("Failed to clear saved session: {}", e);
        }
    }

    fn logout(&mut self) {
        self.lookup.cancel();
        self.selected_country = None;
        self.admin = AdminPanel {
            new_quota: DEFAULT_MAX_QUOTA,
            ..Default::default()
        };
        self.auth = AuthState::Checking;
        let client = self.client.clone();
        self.logout_task = Some(Task::spawn(move || client.logout()));
    }

    fn open_link(&self, url: &str) {
        if let Err(e) = open::that(url) {
            log::error!("Failed to open URL: {}", e);
        }
    }

    fn copy_link(&self, url: &str) {
        let result = arboard::Clipboard::new()
            .and_then(|mut clipboard| clipboard.set_text(url.to_string()));
        if let Err(e) = result {
            log::error!("Failed to copy link: {}", e);
        }
    }

    fn toggle_theme(&mut self) {
        self.is_dark_mode = !self.is_dark_mode;
        self.theme = if self.is_dark_mode { AppTheme::dark() } else { AppTheme::light() };
    }
}

impl eframe::App for InfomapApp {
    fn save(&mut self, storage: &mut dyn eframe::Storage) {
        storage.set_string("is_dark_mode", self.is_dark_mode.to_string());
    }

    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.theme.apply_to_ctx(ctx);
        self.poll_tasks();

        // Keep polling while background work is running
        if self.is_busy() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }

        match &self.auth {
            AuthState::Checking => {
                egui::CentralPanel::default().show(ctx, |ui| {
                    ui.centered_and_justified(|ui| {
                        ui.spinner();
                    });
                });
            }
            AuthState::SignedOut => self.render_login(ctx),
            AuthState::SignedIn(status) => {
                let status = status.clone();
                self.render_header(ctx, &status);
                self.render_control_panel(ctx);
                self.render_history_log(ctx);
                if self.selected_country.is_some() {
                    self.render_news_sidebar(ctx);
                }
                self.render_map(ctx);
                if self.admin.open && status.is_admin {
                    self.render_admin_panel(ctx);
                }
                if self.fatal_error.is_some() {
                    self.render_failure_overlay(ctx);
                }
            }
        }
    }
}

impl InfomapApp {
    fn render_login(&mut self, ctx: &egui::Context) {
        const FULL_TEXT: &str = "SYSTEM ACCESS REQUIRED";

        // Typewriter effect on the title, ten characters per second
        let now = ctx.input(|i| i.time);
        let started = *self.login_started_at.get_or_insert(now);
        let shown = (((now - started) * 10.0) as usize).min(FULL_TEXT.len());
        if shown < FULL_TEXT.len() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.add_space(ui.available_height() * 0.25);
                ui.label(
                    RichText::new(&FULL_TEXT[..shown])
                        .size(28.0)
                        .strong()
                        .color(self.theme.accent),
                );
                ui.add_space(8.0);
                ui.label(
                    RichText::new("Sign in with your authorized account to access the map")
                        .color(self.theme.secondary_text),
                );
                ui.add_space(24.0);

                let login_btn = ui.add(
                    egui::Button::new(
                        RichText::new("Open login page")
                            .size(16.0)
                            .color(self.theme.button_foreground),
                    )
                        .min_size(egui::vec2(240.0, 36.0))
                        .corner_radius(CornerRadius::same(8))
                        .fill(self.theme.button_background),
                );
                if login_btn.clicked() {
                    self.open_link(&self.client.login_url());
                }

                ui.add_space(16.0);
                ui.label(
                    RichText::new("Then paste the session cookie from your browser:")
                        .size(13.0)
                        .color(self.theme.secondary_text),
                );
                ui.add_space(4.0);
                let input = ui.add(
                    egui::TextEdit::singleline(&mut self.session_input)
                        .hint_text("session cookie")
                        .password(true)
                        .desired_width(320.0),
                );
                let submitted = input.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));

                ui.add_space(8.0);
                if ui.button("Connect").clicked() || submitted {
                    self.connect_with_session();
                }

                if let Some(message) = &self.login_message {
                    ui.add_space(8.0);
                    ui.label(RichText::new(message).color(self.theme.error));
                }
            });
        });
    }

    fn render_header(&mut self, ctx: &egui::Context, status: &AuthStatus) {
        egui::TopBottomPanel::top("header").show(ctx, |ui| {
            ui.add_space(6.0);
            ui.horizontal(|ui| {
                ui.label(RichText::new("INFOMAP").size(22.0).strong().color(self.theme.text));
                ui.label(
                    RichText::new("Global news matrix")
                        .size(12.0)
                        .color(self.theme.secondary_text),
                );

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if ui.button("Logout").clicked() {
                        self.logout();
                    }

                    let theme_label = if self.is_dark_mode { "Light" } else { "Dark" };
                    if ui.button(theme_label).clicked() {
                        self.toggle_theme();
                    }

                    if status.is_admin {
                        let admin_btn = ui.add(
                            egui::Button::new(RichText::new("Admin").color(self.theme.accent))
                                .corner_radius(CornerRadius::same(6)),
                        );
                        if admin_btn.clicked() {
                            self.open_admin_panel();
                        }
                    }

                    if let Some(user) = &status.user {
                        let who = if user.name.is_empty() {
                            user.email.clone()
                        } else {
                            format!("{} ({})", user.name, user.email)
                        };
                        ui.label(RichText::new(who).size(12.0).color(self.theme.secondary_text));
                    }

                    ui.add_space(12.0);
                    self.render_quota_hud(ui);
                });
            });
            ui.add_space(6.0);
        });
    }

    fn render_quota_hud(&self, ui: &mut Ui) {
        let max = self.quota_max.max(1);
        let fraction = (self.quota_used as f32 / max as f32).clamp(0.0, 1.0);
        let color = if fraction >= 0.8 { self.theme.error } else { self.theme.accent };

        ui.add(
            egui::ProgressBar::new(fraction)
                .desired_width(140.0)
                .fill(color)
                .text(format!("{} / {}", self.quota_used, self.quota_max)),
        );
        ui.label(RichText::new("API usage").size(12.0).color(self.theme.secondary_text));
    }

    fn render_control_panel(&mut self, ctx: &egui::Context) {
        let mut refresh_needed = false;
        let mut pick: Option<String> = None;

        egui::TopBottomPanel::bottom("control_panel").show(ctx, |ui| {
            ui.add_space(6.0);
            ui.horizontal(|ui| {
                ui.label(RichText::new("Window").size(12.0).color(self.theme.secondary_text));
                for filter in TimeFilter::ALL {
                    let selected = self.time_filter == filter;
                    if self.filter_button(ui, filter.label(), selected).clicked() && !selected {
                        self.time_filter = filter;
                    }
                }

                ui.separator();
                ui.label(RichText::new("Topic").size(12.0).color(self.theme.secondary_text));
                for topic in Topic::ALL {
                    let selected = self.topic == topic;
                    if self.filter_button(ui, topic.label(), selected).clicked() && !selected {
                        self.topic = topic;
                    }
                }

                ui.separator();
                ui.add(
                    egui::TextEdit::singleline(&mut self.country_query)
                        .hint_text("Find a country...")
                        .desired_width(180.0),
                );

                if let Some(country) = &self.selected_country {
                    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                        if ui
                            .button("Apply filters")
                            .on_hover_text(format!("Reload {} with the current filters", country))
                            .clicked()
                        {
                            refresh_needed = true;
                        }
                    });
                }
            });

            let query = self.country_query.trim().to_lowercase();
            if !query.is_empty() {
                ui.horizontal_wrapped(|ui| {
                    let matches = self
                        .country_names
                        .iter()
                        .filter(|name| name.to_lowercase().contains(&query))
                        .take(12);
                    for name in matches {
                        if ui.small_button(name.as_str()).clicked() {
                            pick = Some(name.clone());
                        }
                    }
                });
            }
            ui.add_space(6.0);
        });

        if let Some(country) = pick {
            self.country_query.clear();
            self.select_country(&country);
        } else if refresh_needed {
            self.fetch_news();
        }
    }

    fn filter_button(&self, ui: &mut Ui, label: &str, selected: bool) -> egui::Response {
        ui.add(
            egui::Button::new(
                RichText::new(label)
                    .size(13.0)
                    .color(if selected { Color32::WHITE } else { self.theme.secondary_text }),
            )
            .fill(if selected { self.theme.highlight } else { Color32::TRANSPARENT })
            .corner_radius(CornerRadius::same(6)),
        )
    }

    fn render_history_log(&mut self, ctx: &egui::Context) {
        let mut restore: Option<LookupRecord> = None;
        let mut reset = false;

        egui::SidePanel::left("history_log")
            .resizable(true)
            .default_width(260.0)
            .width_range(220.0..=380.0)
            .show(ctx, |ui| {
                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    ui.heading(
                        RichText::new(format!("Matrix Log ({})", self.history.len()))
                            .size(18.0)
                            .color(self.theme.highlight),
                    );
                    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                        if ui
                            .small_button(RichText::new("Force reset").color(self.theme.error))
                            .clicked()
                        {
                            reset = true;
                        }
                    });
                });
                ui.add_space(4.0);
                ui.add(
                    egui::TextEdit::singleline(&mut self.history_query)
                        .hint_text("Search history...")
                        .desired_width(f32::INFINITY),
                );
                ui.add(egui::Separator::default().spacing(8.0));

                if self.history.is_empty() {
                    ui.add_space(20.0);
                    ui.vertical_centered(|ui| {
                        ui.label(
                            RichText::new("Await reconnaissance")
                                .color(self.theme.secondary_text)
                                .italics(),
                        );
                    });
                    return;
                }

                ScrollArea::vertical()
                    .id_salt("history_scroll_area")
                    .auto_shrink([false, false])
                    .show(ui, |ui| {
                        for record in self.history.search(&self.history_query) {
                            let active = self.selected_country.as_deref()
                                == Some(record.country.as_str())
                                && self.time_filter == record.time_filter
                                && self.topic == record.topic;

                            let text = RichText::new(format!(
                                "{}  ·  {}  ·  {}",
                                record.country,
                                record.topic.as_str(),
                                record.time_filter.as_str()
                            ))
                            .size(13.0)
                            .color(if active { Color32::WHITE } else { self.theme.text });

                            let button = egui::Button::new(text)
                                .fill(if active {
                                    self.theme.highlight
                                } else {
                                    self.theme.button_background
                                })
                                .corner_radius(CornerRadius::same(6))
                                .min_size(egui::vec2(ui.available_width(), 26.0));

                            let captured = record.captured_at.with_timezone(&chrono::Local);
                            if ui
                                .add(button)
                                .on_hover_text(format!(
                                    "Captured {}",
                                    captured.format("%Y-%m-%d %H:%M")
                                ))
                                .clicked()
                            {
                                restore = Some(record.clone());
                            }
                        }
                    });
            });

        if reset {
            self.history.reset();
        }
        if let Some(record) = restore {
            self.restore_from_history(record);
        }
    }

    fn render_news_sidebar(&mut self, ctx: &egui::Context) {
        let Some(country) = self.selected_country.clone() else {
            return;
        };
        let loading = self
            .lookup
            .loading_key()
            .is_some_and(|key| key.country == country);
        let mut close = false;
        let mut refresh = false;
        let mut open_url: Option<String> = None;
        let mut copy_url: Option<String> = None;

        egui::SidePanel::right("news_sidebar")
            .resizable(true)
            .default_width(380.0)
            .width_range(300.0..=520.0)
            .show(ctx, |ui| {
                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    let flag = self
                        .country_stats
                        .as_ref()
                        .map(|s| s.flag_emoji.as_str())
                        .unwrap_or("");
                    ui.heading(
                        RichText::new(format!("{} {}", flag, country).trim())
                            .size(20.0)
                            .strong()
                            .color(self.theme.text),
                    );
                    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                        if ui.button("Close").clicked() {
                            close = true;
                        }
                        if !loading
                            && ui
                                .button("Refresh")
                                .on_hover_text("Update with current filters")
                                .clicked()
                        {
                            refresh = true;
                        }
                    });
                });
                ui.label(
                    RichText::new(if loading {
                        "Decrypting frequencies..."
                    } else {
                        "Real-time signal"
                    })
                        .size(12.0)
                        .color(self.theme.secondary_text),
                );
                ui.add(egui::Separator::default().spacing(8.0));

                if loading {
                    ui.add_space(20.0);
                    ui.vertical_centered(|ui| {
                        ui.spinner();
                    });
                    return;
                }

                if let Some(error) = &self.error {
                    ui.label(RichText::new(error).color(self.theme.error));
                    ui.add_space(8.0);
                }

                if self.news.is_empty() {
                    if self.error.is_none() {
                        ui.label(
                            RichText::new("No headlines for these filters")
                                .color(self.theme.secondary_text)
                                .italics(),
                        );
                    }
                    return;
                }

                if let Some(stats) = &self.country_stats {
                    egui::Grid::new("country_stats_grid")
                        .num_columns(2)
                        .spacing([16.0, 4.0])
                        .show(ui, |ui| {
                            let dim = self.theme.secondary_text;
                            let accent = self.theme.accent;
                            let muted = |text: &str| RichText::new(text).size(12.0).color(dim);
                            let value = |text: &str| RichText::new(text).strong().color(accent);

                            ui.label(muted("Population"));
                            ui.label(value(&stats.population_millions()));
                            ui.end_row();
                            ui.label(muted("Capital"));
                            ui.label(value(&stats.capital));
                            ui.end_row();
                            ui.label(muted("Region"));
                            ui.label(format!("{} / {}", stats.region, stats.subregion));
                            ui.end_row();
                        });
                    ui.add(egui::Separator::default().spacing(8.0));
                }

                ui.label(RichText::new("HEADLINES").size(11.0).color(self.theme.secondary_text));
                ScrollArea::vertical()
                    .id_salt("news_scroll_area")
                    .auto_shrink([false, false])
                    .show(ui, |ui| {
                        for item in &self.news {
                            egui::Frame::default()
                                .fill(self.theme.card_background)
                                .stroke(Stroke::new(1.0, self.theme.separator))
                                .corner_radius(CornerRadius::same(10))
                                .inner_margin(egui::Margin::same(10))
                                .show(ui, |ui| {
                                    ui.set_width(ui.available_width());
                                    ui.horizontal(|ui| {
                                        ui.label(
                                            RichText::new(&item.date)
                                                .size(11.0)
                                                .color(self.theme.accent),
                                        );
                                        if !item.source_url.is_empty() {
                                            let layout =
                                                egui::Layout::right_to_left(egui::Align::Center);
                                            ui.with_layout(layout, |ui| {
                                                if ui.small_button("Copy link").clicked() {
                                                    copy_url = Some(item.source_url.clone());
                                                }
                                            });
                                        }
                                    });
                                    let headline = ui.add(
                                        egui::Label::new(
                                            RichText::new(&item.headline)
                                                .size(15.0)
                                                .strong()
                                                .color(self.theme.text),
                                        )
                                        .sense(Sense::click()),
                                    );
                                    if headline.hovered() {
                                        ui.output_mut(|o| {
                                            o.cursor_icon = egui::CursorIcon::PointingHand
                                        });
                                    }
                                    if headline.clicked() && !item.source_url.is_empty() {
                                        open_url = Some(item.source_url.clone());
                                    }
                                });
                            ui.add_space(6.0);
                        }
                    });
            });

        if let Some(url) = open_url {
            self.open_link(&url);
        }
        if let Some(url) = copy_url {
            self.copy_link(&url);
        }
        if close {
            self.close_country();
        } else if refresh {
            self.fetch_news();
        }
    }

    fn render_map(&mut self, ctx: &egui::Context) {
        let mut clicked_country: Option<String> = None;

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.countries.is_empty() {
                ui.centered_and_justified(|ui| {
                    if self.map_task.is_some() {
                        ui.spinner();
                    } else {
                        ui.label(RichText::new("No map data").color(self.theme.secondary_text));
                    }
                });
                return;
            }

            let (response, painter) = ui.allocate_painter(ui.available_size(), Sense::click());

            // Largest 2:1 rectangle that fits, centred
            let available = response.rect;
            let width = available.width().min(available.height() * 2.0);
            let map_rect =
                egui::Rect::from_center_size(available.center(), egui::vec2(width, width / 2.0));
            painter.rect_filled(map_rect, CornerRadius::same(4), self.theme.ocean);

            let hovered = response
                .hover_pos()
                .filter(|pos| map_rect.contains(*pos))
                .and_then(|pos| {
                    let (lon, lat) = geo::unproject(pos, map_rect);
                    geo::country_at(&self.countries, lon, lat)
                })
                .map(|c| c.name.clone());

            for country in &self.countries {
                let is_selected = self.selected_country.as_deref() == Some(country.name.as_str());
                let is_hovered = hovered.as_deref() == Some(country.name.as_str());
                let stroke = if is_selected {
                    Stroke::new(2.0, self.theme.highlight)
                } else if is_hovered {
                    Stroke::new(1.5, self.theme.text)
                } else if self.history.contains_country(&country.name) {
                    Stroke::new(1.2, self.theme.visited_stroke)
                } else {
                    Stroke::new(0.6, self.theme.country_stroke)
                };

                for ring in &country.rings {
                    let points: Vec<egui::Pos2> = ring
                        .iter()
                        .map(|[lon, lat]| geo::project(*lon, *lat, map_rect))
                        .collect();
                    painter.add(egui::Shape::closed_line(points, stroke));
                }
            }

            if let (Some(name), Some(pos)) = (&hovered, response.hover_pos()) {
                ui.output_mut(|o| o.cursor_icon = egui::CursorIcon::PointingHand);
                painter.text(
                    pos + egui::vec2(12.0, -12.0),
                    egui::Align2::LEFT_BOTTOM,
                    name,
                    egui::FontId::proportional(14.0),
                    self.theme.text,
                );
            }

            if response.clicked() {
                clicked_country = hovered.clone();
            }
        });

        if let Some(country) = clicked_country {
            self.select_country(&country);
        }
    }

    fn render_failure_overlay(&mut self, ctx: &egui::Context) {
        let Some(message) = self.fatal_error.clone() else {
            return;
        };
        let mut reload = false;

        egui::Window::new(RichText::new("System failure").color(self.theme.error).strong())
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, egui::vec2(0.0, 0.0))
            .show(ctx, |ui| {
                ui.set_width(360.0);
                ui.label(RichText::new(&message).color(self.theme.error));
                ui.add_space(12.0);
                ui.vertical_centered(|ui| {
                    if ui.button("Reload").clicked() {
                        reload = true;
                    }
                });
            });

        if reload {
            self.reload();
        }
    }
}

// Admin panel
impl InfomapApp {
    fn open_admin_panel(&mut self) {
        self.admin.open = true;
        self.load_admin_users();
    }

    fn load_admin_users(&mut self) {
        self.admin.loading = true;
        let client = self.client.clone();
        self.admin.users_task = Some(Task::spawn(move || client.admin_list_users()));
    }

    fn run_admin_action(
        &mut self,
        success: String,
        action: impl FnOnce(&InfomapClient) -> ApiResult<()> + Send + 'static,
    ) {
        if self.admin.action_task.is_some() {
            return;
        }
        let client = self.client.clone();
        self.admin.action_task = Some(Task::spawn(move || {
            let result = action(&client);
            (success, result)
        }));
    }

    fn poll_admin_tasks(&mut self) {
        if let Some(result) = Task::poll(&mut self.admin.users_task) {
            self.admin.loading = false;
            match result {
                Ok(users) => {
                    self.admin.quota_edits = users
                        .iter()
                        .map(|u| (u.email.clone(), u.max_daily_quota))
                        .collect();
                    self.admin.users = users;
                }
                Err(e) => {
                    log::error!("Error loading users: {}", e);
                    self.admin.message = Some(format!("Error loading users: {}", e));
                }
            }
        }

        if let Some((success, result)) = Task::poll(&mut self.admin.action_task) {
            match result {
                Ok(()) => {
                    log::info!("{}", success);
                    self.admin.message = Some(success);
                }
                Err(e) => {
                    log::warn!("Admin action failed: {}", e);
                    self.admin.message = Some(format!("Update failed: {}", e));
                }
            }
            self.load_admin_users();
        }
    }

    fn render_admin_panel(&mut self, ctx: &egui::Context) {
        let mut open = self.admin.open;
        let mut add_user: Option<NewUserRequest> = None;
        let mut quota_update: Option<QuotaUpdate> = None;
        let mut status_update: Option<StatusUpdate> = None;
        let mut delete_email: Option<String> = None;
        let busy = self.admin.action_task.is_some();

        egui::Window::new(RichText::new("Intelligence Command").strong())
            .open(&mut open)
            .collapsible(false)
            .resizable(true)
            .default_width(640.0)
            .show(ctx, |ui| {
                ui.label(
                    RichText::new("User authorization and daily quotas")
                        .size(12.0)
                        .color(self.theme.accent),
                );
                ui.add_space(6.0);

                if let Some(message) = &self.admin.message {
                    ui.label(RichText::new(message).color(self.theme.accent));
                    ui.add_space(6.0);
                }

                ui.horizontal(|ui| {
                    ui.add(
                        egui::TextEdit::singleline(&mut self.admin.new_email)
                            .hint_text("email to authorize")
                            .desired_width(220.0),
                    );
                    ui.checkbox(&mut self.admin.new_is_admin, "Admin");
                    ui.label("Quota");
                    ui.add(egui::DragValue::new(&mut self.admin.new_quota).range(0..=1000));
                    let email = self.admin.new_email.trim();
                    if ui
                        .add_enabled(!busy && email.contains('@'), egui::Button::new("Add user"))
                        .clicked()
                    {
                        add_user = Some(NewUserRequest {
                            email: email.to_string(),
                            is_admin: self.admin.new_is_admin,
                            max_daily_quota: self.admin.new_quota,
                        });
                    }
                });
                ui.add(egui::Separator::default().spacing(8.0));

                if self.admin.loading && self.admin.users.is_empty() {
                    ui.vertical_centered(|ui| {
                        ui.spinner();
                    });
                    return;
                }

                ScrollArea::vertical()
                    .id_salt("admin_users_scroll_area")
                    .max_height(420.0)
                    .show(ui, |ui| {
                        egui::Grid::new("admin_users_grid")
                            .num_columns(6)
                            .striped(true)
                            .spacing([12.0, 6.0])
                            .show(ui, |ui| {
                                for header in ["Email", "Role", "Active", "Today", "Quota", ""] {
                                    ui.label(
                                        RichText::new(header)
                                            .size(11.0)
                                            .color(self.theme.secondary_text),
                                    );
                                }
                                ui.end_row();

                                for user in &self.admin.users {
                                    ui.label(RichText::new(&user.email).color(self.theme.text));
                                    ui.label(if user.is_admin {
                                        RichText::new("ADMIN").color(self.theme.highlight)
                                    } else {
                                        RichText::new("VISITOR").color(self.theme.accent)
                                    });

                                    let mut active = user.is_active;
                                    if ui
                                        .add_enabled(
                                            !busy,
                                            egui::Checkbox::without_text(&mut active),
                                        )
                                        .changed()
                                    {
                                        status_update = Some(StatusUpdate {
                                            email: user.email.clone(),
                                            is_active: active,
                                        });
                                    }

                                    ui.label(format!("{}", user.today_count));

                                    ui.horizontal(|ui| {
                                        let edit = self
                                            .admin
                                            .quota_edits
                                            .entry(user.email.clone())
                                            .or_insert(user.max_daily_quota);
                                        ui.add(egui::DragValue::new(edit).range(0..=1000));
                                        if *edit != user.max_daily_quota
                                            && ui
                                                .add_enabled(!busy, egui::Button::new("Save"))
                                                .clicked()
                                        {
                                            quota_update = Some(QuotaUpdate {
                                                email: user.email.clone(),
                                                max_daily_quota: *edit,
                                            });
                                        }
                                    });

                                    if ui
                                        .add_enabled(
                                            !busy,
                                            egui::Button::new(
                                                RichText::new("Delete").color(self.theme.error),
                                            ),
                                        )
                                        .clicked()
                                    {
                                        delete_email = Some(user.email.clone());
                                    }
                                    ui.end_row();
                                }
                            });
                    });
            });

        self.admin.open = open;

        if let Some(request) = add_user {
            self.admin.new_email.clear();
            let success = format!("Authorized {}", request.email);
            self.run_admin_action(success, move |client| client.admin_add_user(&request));
        } else if let Some(update) = quota_update {
            let success = format!("Updated {} successfully", update.email);
            self.run_admin_action(success, move |client| client.admin_update_quota(&update));
        } else if let Some(update) = status_update {
            let success = format!(
                "{} {}",
                if update.is_active { "Activated" } else { "Deactivated" },
                update.email
            );
            self.run_admin_action(success, move |client| client.admin_set_status(&update));
        } else if let Some(email) = delete_email {
            let success = format!("Removed {}", email);
            self.run_admin_action(success, move |client| client.admin_delete_user(&email));
        }
    }
}
