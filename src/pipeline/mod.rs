pub mod extract;
pub mod needs_ocr;
pub mod normalize;
pub mod orchestrator; // Stage driver: discover → preflight → parse → OCR → contracts → sync
pub mod stage_cache;
pub mod trace;
