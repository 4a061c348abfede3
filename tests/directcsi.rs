mod directcsi {
    mod apis {
        mod storage_migration;
    }
    mod engine {
        mod pipeline;
    }
    mod volume_lifecycle {
        mod end_to_end;
    }
}
