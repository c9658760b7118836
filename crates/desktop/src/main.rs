//! ArchDash Desktop: application entry.

mod app;

use eframe::egui;

fn main() -> eframe::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1000.0, 700.0])
            .with_min_inner_size([640.0, 480.0]),
        ..Default::default()
    };
    eframe::run_native(
        "ArchDash",
        options,
        Box::new(|cc| Box::new(app::ArchDashApp::new(cc))),
    )
}
